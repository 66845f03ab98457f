//! The [`TransportProxy`] and the [`Transport`] trait it is generic over.
//!
//! A proxy owns one server channel and one [`SessionTable`]. Everything that
//! differs between TCP and UDP (how the server channel is bound, what a
//! session holds, whether a live session may be reused) lives behind
//! [`Transport`]; the lifecycle and the table bookkeeping are written once
//! here.

use crate::{
    clock::{SharedClock, SystemClock},
    config::ProxyConfig,
    logging,
    selector::Selector,
    session::{Session, SessionCore},
    session_table::{RemovalCause, SessionObserver, SessionTable},
};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// The server side of a proxy: a listening or bound channel.
pub trait ServerChannel: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    fn is_open(&self) -> bool;

    /// Closes the channel and stops its driver.
    fn close(&self) -> io::Result<()>;
}

/// The transport-specific half of a [`TransportProxy`].
pub trait Transport: Send + Sync + Sized + 'static {
    type Channel: ServerChannel;
    type Session: Session;

    /// A short name for diagnostics, such as `"tcp"`.
    const NAME: &'static str;

    /// Binds the server channel at `bind` and registers its driver on
    /// `selector`. The driver may keep a clone of `proxy` to look sessions
    /// up.
    fn create_channel(
        &self,
        selector: &Selector,
        bind: SocketAddr,
        proxy: &TransportProxy<Self>,
    ) -> io::Result<Self::Channel>;

    /// Creates the session for a new flow. Must not block.
    fn create_session(&self, selector: &Selector, core: SessionCore)
        -> io::Result<Self::Session>;

    /// Whether `pick_session` may hand out `existing`, the live session for
    /// the same source port, instead of creating a new one for `remote`.
    fn reuse_session(&self, existing: &Self::Session, remote: SocketAddr) -> bool {
        let _ = (existing, remote);
        false
    }

    /// Whether `session` may be reclaimed to make room. Finished sessions are
    /// reclaimed regardless.
    fn should_recycle(&self, session: &Self::Session, timeout: Duration) -> bool {
        session.idle_for() >= timeout
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("The proxy is already running")]
    AlreadyStarted,
    #[error("The proxy has been closed")]
    Closed,
    #[error("Failed to create the server channel: {0}")]
    Bind(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PickError {
    #[error("The proxy is not running")]
    NotRunning,
    #[error("Failed to create a session: {0}")]
    Create(#[from] io::Error),
}

/// A transport-layer proxy: one server channel plus the table of sessions
/// relayed through it.
///
/// Proxies are cheap to clone; clones share the same channel and table.
pub struct TransportProxy<T: Transport> {
    inner: Arc<ProxyInner<T>>,
}

struct ProxyInner<T: Transport> {
    transport: Arc<T>,
    config: ProxyConfig,
    clock: SharedClock,
    sessions: SessionTable<T::Session>,
    state: RwLock<State<T::Channel>>,
}

enum State<C> {
    Created,
    Running { selector: Selector, channel: Arc<C> },
    Closed,
}

/// Closes and logs every session leaving a proxy's table.
struct ProxyObserver<T> {
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: Transport> SessionObserver<T::Session> for ProxyObserver<T> {
    fn on_removed(&self, session: &Arc<T::Session>, cause: RemovalCause, remaining: usize) {
        if let Err(e) = session.close() {
            logging::session_close_failed(T::NAME, &**session, &e);
        }
        logging::session_removed(T::NAME, &**session, cause, remaining);
    }

    fn should_recycle(&self, session: &T::Session) -> bool {
        session.is_finished() || self.transport.should_recycle(session, self.timeout)
    }
}

impl<T: Transport> TransportProxy<T> {
    /// Creates a proxy that is not yet running.
    pub fn new(transport: T, config: ProxyConfig) -> Self {
        Self::with_clock(transport, config, SystemClock::shared())
    }

    /// Creates a proxy whose sessions read time from `clock`.
    pub fn with_clock(transport: T, config: ProxyConfig, clock: SharedClock) -> Self {
        let transport = Arc::new(transport);
        let observer = Arc::new(ProxyObserver {
            transport: transport.clone(),
            timeout: config.session_timeout,
        });
        Self {
            inner: Arc::new(ProxyInner {
                transport,
                config,
                clock,
                sessions: SessionTable::new(config.max_sessions, observer),
                state: RwLock::new(State::Created),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Creates the server channel and registers it on `selector`.
    pub fn start(&self, selector: &Selector) -> Result<(), StartError> {
        match *self.state() {
            State::Created => {}
            State::Running { .. } => return Err(StartError::AlreadyStarted),
            State::Closed => return Err(StartError::Closed),
        }

        let channel = Arc::new(self.inner.transport.create_channel(
            selector,
            self.inner.config.bind,
            self,
        )?);

        let mut state = self.state_mut();
        let error = match *state {
            State::Created => None,
            State::Running { .. } => Some(StartError::AlreadyStarted),
            State::Closed => Some(StartError::Closed),
        };
        if let Some(error) = error {
            drop(state);
            let _ = channel.close();
            return Err(error);
        }
        let local = channel.local_addr();
        *state = State::Running {
            selector: selector.clone(),
            channel,
        };
        drop(state);

        logging::proxy_started(T::NAME, local);
        Ok(())
    }

    /// Whether the proxy was started and its server channel is still open.
    pub fn is_running(&self) -> bool {
        self.channel().is_some_and(|channel| channel.is_open())
    }

    /// The local port of the server channel, once started.
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel().map(|channel| channel.local_addr())
    }

    /// Creates a session for the flow from `source_port` to `remote` and puts
    /// it in the table, superseding any session already under that port.
    ///
    /// If the transport allows it, the live session already under the port is
    /// returned instead.
    pub fn pick_session(
        &self,
        source_port: u16,
        remote: SocketAddr,
    ) -> Result<Arc<T::Session>, PickError> {
        // Held until the session is in the table so that `close` cannot clear
        // the table in between.
        let state = self.state();
        let State::Running { selector, .. } = &*state else {
            return Err(PickError::NotRunning);
        };

        if let Some(existing) = self.inner.sessions.get(source_port) {
            if !existing.is_finished() && self.inner.transport.reuse_session(&existing, remote) {
                existing.active();
                return Ok(existing);
            }
        }

        let core = SessionCore::new(source_port, remote, self.inner.clock.clone());
        let session = Arc::new(self.inner.transport.create_session(selector, core)?);
        logging::session_opened(T::NAME, &*session);
        self.inner.sessions.put(source_port, session.clone());
        Ok(session)
    }

    /// The live session for `source_port`, if any.
    pub fn get_session(&self, source_port: u16) -> Option<Arc<T::Session>> {
        self.inner.sessions.get(source_port)
    }

    /// Marks the session for `source_port` finished and removes it. The
    /// session's channel is closed before this returns.
    pub fn finish_session(&self, source_port: u16) -> Option<Arc<T::Session>> {
        self.inner.sessions.finish(source_port)
    }

    /// Finishes and removes `session` if it is still the live session for its
    /// source port. Transports call this when a flow ends on its own.
    pub fn release_session(&self, session: &Arc<T::Session>) -> bool {
        self.inner.sessions.release(session.source_port(), session)
    }

    /// Reclaims every session that has been idle for too long. Returns how many
    /// were reclaimed.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sessions.sweep()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.size()
    }

    /// Removes and closes every session, then closes the server channel.
    ///
    /// The proxy cannot be started again. Closing a closed proxy does
    /// nothing.
    pub fn close(&self) -> io::Result<()> {
        let previous = std::mem::replace(&mut *self.state_mut(), State::Closed);
        let channel = match previous {
            State::Closed => return Ok(()),
            State::Created => None,
            State::Running { channel, .. } => Some(channel),
        };

        let cleared = self.inner.sessions.clear();
        if let Some(channel) = channel {
            channel.close()?;
        }
        logging::proxy_closed(T::NAME, cleared);
        Ok(())
    }

    fn channel(&self) -> Option<Arc<T::Channel>> {
        match &*self.state() {
            State::Running { channel, .. } => Some(channel.clone()),
            State::Created | State::Closed => None,
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, State<T::Channel>> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, State<T::Channel>> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Clone for TransportProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
