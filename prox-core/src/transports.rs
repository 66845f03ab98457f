//! Concrete transports for [`TransportProxy`](crate::TransportProxy).
//!
//! Both transports accept an optional forward target. When a flow arrives
//! whose source port has no session registered by the dispatch layer, a
//! transport with a forward target picks a session to that target; one
//! without drops the flow.

pub mod tcp;
pub use tcp::{Tcp, TcpChannel, TcpSession};

pub mod udp;
pub use udp::{Udp, UdpChannel, UdpSession};

use crate::{proxy::Transport, TransportProxy};
use std::{net::SocketAddr, sync::Arc, time::Duration};

/// Pause after a server channel error so a persistent one does not spin the
/// driver.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Resolves the session for a flow arriving from `peer`, picking one to
/// `forward` if the dispatch layer has not registered any.
fn resolve_session<T: Transport>(
    proxy: &TransportProxy<T>,
    peer: SocketAddr,
    forward: Option<SocketAddr>,
) -> Option<Arc<T::Session>> {
    if let Some(session) = proxy.get_session(peer.port()) {
        return Some(session);
    }
    let Some(target) = forward else {
        tracing::debug!(
            transport = T::NAME,
            source_port = peer.port(),
            "No session for incoming flow, dropping it"
        );
        return None;
    };
    match proxy.pick_session(peer.port(), target) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(
                transport = T::NAME,
                source_port = peer.port(),
                "Failed to open a session to {}: {}",
                target,
                e
            );
            None
        }
    }
}
