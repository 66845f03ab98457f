use tokio::sync::broadcast;

/// A struct which can be used to stop every task registered on a
/// [`Selector`](crate::Selector). Cloned shutdowns are connected.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// This channel tells registered tasks to stop.
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    /// Creates a new active shutdown.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self { notify }
    }

    /// Signals every receiver subscribed to this shutdown or its clones.
    pub fn shut_down(&self) {
        if self.notify.send(()).is_err() {
            tracing::trace!("Shutdown sent with no running tasks");
        }
    }

    /// Subscribes to the signal. Receivers only see signals sent after they
    /// subscribe.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            recv: self.notify.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscription to a [`Shutdown`].
#[derive(Debug)]
pub struct ShutdownSignal {
    recv: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    /// Waits until the shutdown is signalled.
    pub async fn wait_for_shutdown(&mut self) {
        use tokio::sync::broadcast::error::RecvError;

        loop {
            match self.recv.recv().await {
                Ok(()) | Err(RecvError::Closed) => return,
                Err(RecvError::Lagged(_)) => (),
            }
        }
    }
}
