use std::{net::SocketAddr, time::Duration};

/// Settings for one [`TransportProxy`](crate::TransportProxy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Where the server channel binds. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// The most sessions the proxy keeps live at once.
    pub max_sessions: usize,
    /// How long a session may go without activity before it is recyclable.
    pub session_timeout: Duration,
}

impl ProxyConfig {
    pub const DEFAULT_MAX_SESSIONS: usize = 256;
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_sessions: Self::DEFAULT_MAX_SESSIONS,
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
        }
    }
}
