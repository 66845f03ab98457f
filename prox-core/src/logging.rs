//! Wrapper functions for logging session lifecycle events.
//!
//! Each function corresponds to one kind of event and records it with the
//! structured fields a subscriber needs to follow one session through its
//! proxy: transport, source port, session id, and removal cause.

use crate::{session::Session, session_table::RemovalCause};
use std::{io, net::SocketAddr};
use tracing::{event, Level};

/// A proxy's server channel is up.
pub fn proxy_started(transport: &'static str, local: SocketAddr) {
    event!(
        Level::DEBUG,
        transport,
        port = local.port(),
        "Proxy running on {}",
        local.port()
    );
}

/// A proxy tore down its sessions and server channel.
pub fn proxy_closed(transport: &'static str, sessions: usize) {
    event!(
        Level::DEBUG,
        transport,
        sessions,
        "Proxy closed"
    );
}

/// A session was created and put in its proxy's table.
pub fn session_opened<S: Session>(transport: &'static str, session: &S) {
    event!(
        Level::TRACE,
        transport,
        id = %session.id(),
        source_port = session.source_port(),
        remote = %session.remote_addr(),
        "Opened session {}",
        session.id()
    );
}

/// A session left its proxy's table.
pub fn session_removed<S: Session>(
    transport: &'static str,
    session: &S,
    cause: RemovalCause,
    remaining: usize,
) {
    if session.is_finished() {
        event!(
            Level::TRACE,
            transport,
            id = %session.id(),
            source_port = session.source_port(),
            %cause,
            "Removed finished session {}",
            session.id()
        );
    } else {
        event!(
            Level::TRACE,
            transport,
            id = %session.id(),
            source_port = session.source_port(),
            %cause,
            "Terminated session {}, session count: {}",
            session.id(),
            remaining
        );
    }
}

/// Closing a session's channel failed. Not actionable, so only recorded.
pub fn session_close_failed<S: Session>(transport: &'static str, session: &S, error: &io::Error) {
    event!(
        Level::DEBUG,
        transport,
        id = %session.id(),
        %error,
        "Failed to close session {}",
        session.id()
    );
}
