//! The readiness loop shared by every proxy.
//!
//! A [`Selector`] wraps a tokio runtime handle. Channels "register" by handing
//! the selector the future that services them; the selector spawns it and
//! keeps track of it until it completes, is cancelled through its
//! [`Registration`], or the whole selector is shut down.

use crate::{shutdown::Shutdown, FxDashMap};
use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{runtime::Handle, task::AbortHandle};

/// Identifies one registration on a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

/// A shared handle to a readiness loop.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    handle: Handle,
    registrations: FxDashMap<Token, &'static str>,
    next_token: AtomicU64,
    shutdown: Shutdown,
    shut_down: AtomicBool,
}

impl Selector {
    /// Creates a selector that runs its registrations on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                handle,
                registrations: Default::default(),
                next_token: AtomicU64::new(0),
                shutdown: Shutdown::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a selector on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Spawns `future` as a registered channel driver.
    ///
    /// The future is dropped when it completes, when the returned
    /// registration is cancelled, or when the selector shuts down.
    pub fn register<F>(&self, label: &'static str, future: F) -> io::Result<Registration>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut signal = self.inner.shutdown.subscribe();
        if self.is_shut_down() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "the selector has been shut down",
            ));
        }

        let token = Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.inner.registrations.insert(token, label);

        let selector = Arc::downgrade(&self.inner);
        let task = self.inner.handle.spawn(async move {
            tokio::select! {
                _ = future => {}
                _ = signal.wait_for_shutdown() => {
                    tracing::trace!(label, "Registration stopped by shutdown");
                }
            }
            if let Some(selector) = selector.upgrade() {
                selector.registrations.remove(&token);
            }
        });

        Ok(Registration {
            token,
            task: task.abort_handle(),
            selector: Arc::downgrade(&self.inner),
        })
    }

    /// The number of registrations still running.
    pub fn registered(&self) -> usize {
        self.inner.registrations.len()
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.inner.registrations.contains_key(&token)
    }

    /// Stops every registration and refuses new ones.
    pub fn shut_down(&self) {
        if !self.inner.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                registered = self.registered(),
                "Shutting down selector"
            );
            self.inner.shutdown.shut_down();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

/// A channel driver registered on a [`Selector`].
#[derive(Debug)]
pub struct Registration {
    token: Token,
    task: AbortHandle,
    selector: Weak<SelectorInner>,
}

impl Registration {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Stops the driver. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.task.abort();
        if let Some(selector) = self.selector.upgrade() {
            selector.registrations.remove(&self.token);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
