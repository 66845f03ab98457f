//! The [`Session`] trait and supporting types.

use crate::{clock::SharedClock, id::SessionId};
use std::{
    fmt::Debug,
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

/// Holds the state for one relayed flow.
///
/// A [`Transport`](crate::proxy::Transport) creates a session when the
/// dispatch layer sees a new flow. The session is keyed in its proxy's
/// [`SessionTable`](crate::SessionTable) by the flow's source port and lives
/// there until it is finished, evicted, replaced, or the proxy closes.
///
/// Implementors embed a [`SessionCore`] for the identity and activity
/// bookkeeping shared by every transport, and release their own channel in
/// [`close`](Session::close).
pub trait Session: Send + Sync + 'static {
    /// The transport-independent part of the session.
    fn core(&self) -> &SessionCore;

    /// Releases the session's channel.
    ///
    /// The owning proxy calls this exactly once, when the session leaves the
    /// table. Errors are logged by the caller and otherwise ignored.
    fn close(&self) -> io::Result<()>;

    fn id(&self) -> SessionId {
        self.core().id()
    }

    fn source_port(&self) -> u16 {
        self.core().source_port()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.core().remote_addr()
    }

    /// Marks the session as active so it is not reclaimed as idle.
    fn active(&self) {
        self.core().active()
    }

    /// Marks the session as finished. This does not remove it from its table.
    fn finish(&self) {
        self.core().finish()
    }

    fn is_finished(&self) -> bool {
        self.core().is_finished()
    }

    fn last_active(&self) -> Instant {
        self.core().last_active()
    }

    /// How long it has been since the session was last active.
    fn idle_for(&self) -> Duration {
        self.core().idle_for()
    }
}

/// Identity and activity bookkeeping common to all sessions.
pub struct SessionCore {
    id: SessionId,
    source_port: u16,
    remote: SocketAddr,
    clock: SharedClock,
    last_active: Mutex<Instant>,
    finished: AtomicBool,
}

impl SessionCore {
    /// Creates the core of a session for the flow from `source_port` to
    /// `remote`, active as of now.
    pub fn new(source_port: u16, remote: SocketAddr, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            id: SessionId::next(),
            source_port,
            remote,
            clock,
            last_active: Mutex::new(now),
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The source port of the original flow; the session's key.
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_address(&self) -> IpAddr {
        self.remote.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn active(&self) {
        let now = self.clock.now();
        let mut last_active = self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if now > *last_active {
            *last_active = now;
        }
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn last_active(&self) -> Instant {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_for(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.last_active())
    }
}

impl Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("source_port", &self.source_port)
            .field("remote", &self.remote)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn remote() -> SocketAddr {
        "93.184.216.34:443".parse().unwrap()
    }

    #[test]
    fn identity_is_kept() {
        let core = SessionCore::new(40000, remote(), ManualClock::shared());
        assert_eq!(core.source_port(), 40000);
        assert_eq!(core.remote_address(), remote().ip());
        assert_eq!(core.remote_port(), 443);
        assert!(!core.is_finished());
    }

    #[test]
    fn active_resets_idle_time() {
        let clock = ManualClock::shared();
        let core = SessionCore::new(40000, remote(), clock.clone());
        clock.advance(Duration::from_secs(30));
        assert_eq!(core.idle_for(), Duration::from_secs(30));
        core.active();
        assert_eq!(core.idle_for(), Duration::ZERO);
    }

    #[test]
    fn finish_is_one_way() {
        let core = SessionCore::new(40000, remote(), ManualClock::shared());
        core.finish();
        core.finish();
        assert!(core.is_finished());
    }
}
