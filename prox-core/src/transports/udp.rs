//! Relays UDP datagrams.
//!
//! The server channel is a bound datagram socket. A datagram from source port
//! P goes out through the relay socket of the session registered for P, which
//! is connected to the session's remote. Replies from the remote are sent back
//! to the client through the server socket. UDP flows have no end of stream,
//! so sessions stay until they are reclaimed as idle, replaced, or the proxy
//! closes.

use super::{resolve_session, ERROR_BACKOFF};
use crate::{
    proxy::{ServerChannel, Transport},
    selector::{Registration, Selector},
    session::{Session, SessionCore},
    TransportProxy,
};
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::net::UdpSocket;

/// Large enough for any datagram.
const MAX_DATAGRAM: usize = 65536;

/// The UDP transport.
#[derive(Debug, Default)]
pub struct Udp {
    forward: Option<SocketAddr>,
    /// The socket of the running server channel, once it is registered.
    server: Mutex<Weak<UdpSocket>>,
}

impl Udp {
    /// Creates a transport that only relays flows registered through
    /// [`TransportProxy::pick_session`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a transport that relays unregistered flows to `target`.
    pub fn forwarding(target: SocketAddr) -> Self {
        Self {
            forward: Some(target),
            ..Default::default()
        }
    }

    pub fn forward_target(&self) -> Option<SocketAddr> {
        self.forward
    }

    fn server(&self) -> MutexGuard<'_, Weak<UdpSocket>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for Udp {
    type Channel = UdpChannel;
    type Session = UdpSession;

    const NAME: &'static str = "udp";

    fn create_channel(
        &self,
        selector: &Selector,
        bind: SocketAddr,
        proxy: &TransportProxy<Self>,
    ) -> io::Result<UdpChannel> {
        let mut server = self.server();
        if server.upgrade().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "the transport already has a server channel",
            ));
        }

        let socket = std::net::UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let socket = {
            let _runtime = selector.handle().enter();
            Arc::new(UdpSocket::from_std(socket)?)
        };
        let registration =
            selector.register("udp-receive", receive(socket.clone(), proxy.clone()))?;
        *server = Arc::downgrade(&socket);
        drop(server);

        Ok(UdpChannel {
            local,
            socket: Mutex::new(Some(socket)),
            registration,
        })
    }

    fn create_session(&self, selector: &Selector, core: SessionCore) -> io::Result<UdpSession> {
        let server = self.server().upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "the server channel is not bound")
        })?;

        let remote = core.remote_addr();
        let unspecified = match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let relay = std::net::UdpSocket::bind(unspecified)?;
        relay.connect(remote)?;
        relay.set_nonblocking(true)?;
        let relay = {
            let _runtime = selector.handle().enter();
            Arc::new(UdpSocket::from_std(relay)?)
        };

        Ok(UdpSession {
            core,
            selector: selector.clone(),
            server,
            state: Mutex::new(UdpState {
                client: None,
                relay: Some(relay),
                replies: None,
            }),
        })
    }

    fn reuse_session(&self, existing: &UdpSession, remote: SocketAddr) -> bool {
        existing.remote_addr() == remote
    }
}

/// A bound UDP socket registered on a selector.
///
/// Sessions hold the socket too, to send replies, so it is only unbound once
/// the channel is closed and every session is gone.
#[derive(Debug)]
pub struct UdpChannel {
    local: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    registration: Registration,
}

impl ServerChannel for UdpChannel {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn is_open(&self) -> bool {
        self.socket().is_some()
    }

    fn close(&self) -> io::Result<()> {
        if self.socket().take().is_some() {
            self.registration.cancel();
        }
        Ok(())
    }
}

impl UdpChannel {
    fn socket(&self) -> MutexGuard<'_, Option<Arc<UdpSocket>>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One relayed UDP flow.
pub struct UdpSession {
    core: SessionCore,
    selector: Selector,
    server: Arc<UdpSocket>,
    state: Mutex<UdpState>,
}

struct UdpState {
    /// Where replies go; the address the last datagram came from.
    client: Option<SocketAddr>,
    /// `None` once the session is closed.
    relay: Option<Arc<UdpSocket>>,
    replies: Option<Registration>,
}

impl UdpSession {
    /// The address replies are sent to, once the client has sent anything.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.state().client
    }

    /// The local address of the socket relaying to the remote.
    pub fn relay_addr(&self) -> io::Result<SocketAddr> {
        match &self.state().relay {
            Some(relay) => relay.local_addr(),
            None => Err(closed()),
        }
    }

    /// Sends `payload` from `client` to the remote, starting to relay replies
    /// if this is the first datagram.
    pub async fn forward(self: &Arc<Self>, payload: &[u8], client: SocketAddr) -> io::Result<()> {
        let relay = {
            let mut state = self.state();
            let Some(relay) = state.relay.clone() else {
                return Err(closed());
            };
            state.client = Some(client);
            if state.replies.is_none() {
                let replies = self
                    .selector
                    .register("udp-replies", relay_replies(self.clone(), relay.clone()))?;
                state.replies = Some(replies);
            }
            relay
        };
        self.active();
        relay.send(payload).await?;
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, UdpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Session for UdpSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.state();
        state.relay = None;
        if let Some(replies) = state.replies.take() {
            replies.cancel();
        }
        Ok(())
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "the session is closed")
}

async fn receive(socket: Arc<UdpSocket>, proxy: TransportProxy<Udp>) {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("Failed to receive a UDP datagram: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(session) = resolve_session(&proxy, peer, proxy.transport().forward) else {
            continue;
        };
        if let Err(e) = session.forward(&buf[..len], peer).await {
            tracing::debug!(id = %session.id(), "Failed to relay a datagram from {}: {}", peer, e);
        }
    }
}

async fn relay_replies(session: Arc<UdpSession>, relay: Arc<UdpSocket>) {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        let len = match relay.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                // Connected sockets report ICMP errors for earlier sends here.
                tracing::trace!(id = %session.id(), "Relay receive failed: {}", e);
                continue;
            }
        };
        session.active();
        let Some(client) = session.client_addr() else {
            continue;
        };
        if let Err(e) = session.server.send_to(&buf[..len], client).await {
            tracing::debug!(id = %session.id(), "Failed to return a datagram to {}: {}", client, e);
        }
    }
}
