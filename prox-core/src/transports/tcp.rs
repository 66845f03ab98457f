//! Relays TCP connections.
//!
//! The server channel is a listener. When a client connects from source port
//! P, the session registered for P connects its relay socket to the remote
//! and bytes are pumped both ways until both directions reach end of stream.
//! The session then releases itself from the proxy.

use super::{resolve_session, ERROR_BACKOFF};
use crate::{
    proxy::{ServerChannel, Transport},
    selector::{Registration, Selector},
    session::{Session, SessionCore},
    TransportProxy,
};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
};

const BUFFER_SIZE: usize = 16 * 1024;

/// The TCP transport.
#[derive(Debug, Default, Clone)]
pub struct Tcp {
    forward: Option<SocketAddr>,
}

impl Tcp {
    /// Creates a transport that only relays flows registered through
    /// [`TransportProxy::pick_session`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a transport that relays unregistered flows to `target`.
    pub fn forwarding(target: SocketAddr) -> Self {
        Self {
            forward: Some(target),
        }
    }

    pub fn forward_target(&self) -> Option<SocketAddr> {
        self.forward
    }
}

impl Transport for Tcp {
    type Channel = TcpChannel;
    type Session = TcpSession;

    const NAME: &'static str = "tcp";

    fn create_channel(
        &self,
        selector: &Selector,
        bind: SocketAddr,
        proxy: &TransportProxy<Self>,
    ) -> io::Result<TcpChannel> {
        let listener = std::net::TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let listener = {
            let _runtime = selector.handle().enter();
            TcpListener::from_std(listener)?
        };
        let registration = selector.register("tcp-accept", accept(listener, proxy.clone()))?;
        Ok(TcpChannel {
            local,
            open: AtomicBool::new(true),
            registration,
        })
    }

    fn create_session(&self, selector: &Selector, core: SessionCore) -> io::Result<TcpSession> {
        let socket = match core.remote_addr() {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        Ok(TcpSession {
            core,
            selector: selector.clone(),
            state: Mutex::new(RelayState::Pending(socket)),
        })
    }
}

/// A listening TCP socket registered on a selector.
#[derive(Debug)]
pub struct TcpChannel {
    local: SocketAddr,
    open: AtomicBool,
    registration: Registration,
}

impl ServerChannel for TcpChannel {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> io::Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            // The listener is owned by the accept loop and dropped with it.
            self.registration.cancel();
        }
        Ok(())
    }
}

/// One relayed TCP connection.
pub struct TcpSession {
    core: SessionCore,
    selector: Selector,
    state: Mutex<RelayState>,
}

enum RelayState {
    /// Holds the relay socket until the client connects.
    Pending(TcpSocket),
    Relaying(Registration),
    Closed,
}

impl TcpSession {
    /// Whether a client connection is being relayed.
    pub fn is_relaying(&self) -> bool {
        matches!(*self.state(), RelayState::Relaying(_))
    }

    /// Starts relaying `inbound` to the session's remote.
    fn attach(self: &Arc<Self>, inbound: TcpStream, proxy: &TransportProxy<Tcp>) -> io::Result<()> {
        let mut state = self.state();
        let socket = match std::mem::replace(&mut *state, RelayState::Closed) {
            RelayState::Pending(socket) => socket,
            RelayState::Relaying(registration) => {
                *state = RelayState::Relaying(registration);
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "the session is already relaying a connection",
                ));
            }
            RelayState::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "the session is closed",
                ))
            }
        };

        let session = self.clone();
        let proxy = proxy.clone();
        let registration = self.selector.register("tcp-relay", async move {
            let remote = session.remote_addr();
            match socket.connect(remote).await {
                Ok(outbound) => {
                    session.active();
                    relay(&session, inbound, outbound).await;
                }
                Err(e) => {
                    tracing::debug!(id = %session.id(), "Failed to connect to {}: {}", remote, e);
                }
            }
            proxy.release_session(&session);
        })?;
        *state = RelayState::Relaying(registration);
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Session for TcpSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn close(&self) -> io::Result<()> {
        match std::mem::replace(&mut *self.state(), RelayState::Closed) {
            RelayState::Relaying(registration) => registration.cancel(),
            RelayState::Pending(_) | RelayState::Closed => {}
        }
        Ok(())
    }
}

async fn accept(listener: TcpListener, proxy: TransportProxy<Tcp>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Failed to accept a TCP connection: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(session) = resolve_session(&proxy, peer, proxy.transport().forward) else {
            continue;
        };
        session.active();
        if let Err(e) = session.attach(stream, &proxy) {
            tracing::debug!(id = %session.id(), "Dropping connection from {}: {}", peer, e);
        }
    }
}

async fn relay(session: &TcpSession, inbound: TcpStream, outbound: TcpStream) {
    let (mut client_read, mut client_write) = inbound.into_split();
    let (mut remote_read, mut remote_write) = outbound.into_split();
    let (sent, received) = futures::future::join(
        pump(session, &mut client_read, &mut remote_write),
        pump(session, &mut remote_read, &mut client_write),
    )
    .await;
    tracing::trace!(id = %session.id(), sent, received, "TCP relay finished");
}

/// Copies `reader` into `writer` until end of stream or an error, marking the
/// session active on every read. Returns the number of bytes copied.
async fn pump<R, W>(session: &TcpSession, reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; BUFFER_SIZE];
    let mut copied = 0;
    loop {
        let len = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(len) => len,
        };
        session.active();
        if writer.write_all(&buf[..len]).await.is_err() {
            break;
        }
        copied += len as u64;
    }
    let _ = writer.shutdown().await;
    copied
}
