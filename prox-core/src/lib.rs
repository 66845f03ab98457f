//! The session-tracking core of a user-space transport relay.
//!
//! Flows redirected from a single host (for example off a virtual network
//! interface) arrive at one server channel per transport. Each flow is keyed
//! by its source port and relayed through a session that talks to the real
//! remote endpoint.
//!
//! # Organization
//! - [`Session`] and [`SessionCore`] describe one relayed flow
//! - [`SessionTable`] is the bounded, evicting map from source port to session
//! - [`TransportProxy`] owns a server channel and a table, and is generic over
//!   a [`Transport`]
//! - [`Selector`] is the readiness loop every proxy registers on
//! - [`transports`] provides the TCP and UDP transports
//!
//! # Eviction
//!
//! Tables are bounded. Whenever a session is put in a table, every session
//! that has been idle for the proxy's session timeout is reclaimed first; if
//! the table is still full the least recently active session is evicted. Idle
//! sessions can also be reclaimed on a timer with
//! [`TransportProxy::sweep_idle`]. Every removal closes the session's channel
//! exactly once.

use dashmap::DashMap;
use std::hash::BuildHasherDefault;

pub(crate) use rustc_hash::FxHashMap;

/// A [`DashMap`] using the Fx hasher.
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

mod logging;

pub mod clock;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

pub mod config;
pub use config::ProxyConfig;

mod id;
pub use id::SessionId;

pub mod session;
pub use session::{Session, SessionCore};

pub mod session_table;
pub use session_table::{RemovalCause, SessionObserver, SessionTable};

pub mod proxy;
pub use proxy::{PickError, ServerChannel, StartError, Transport, TransportProxy};

pub mod selector;
pub use selector::{Registration, Selector};

mod shutdown;
pub use shutdown::{Shutdown, ShutdownSignal};

pub mod transports;
