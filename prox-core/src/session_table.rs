//! A bounded table of live sessions keyed by source port.

use crate::{session::Session, FxHashMap};
use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Why a session left a [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by key through [`SessionTable::remove`].
    Removed,
    /// Marked finished and removed, by key or by the session's own flow.
    Finished,
    /// Superseded by a new session for the same key.
    Replaced,
    /// Reclaimed because the recycle predicate held.
    Recycled,
    /// Forced out to make room while nothing was recyclable.
    Evicted,
    /// Dropped while the table was torn down.
    Cleared,
}

impl Display for RemovalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemovalCause::Removed => "removed",
            RemovalCause::Finished => "finished",
            RemovalCause::Replaced => "replaced",
            RemovalCause::Recycled => "recycled",
            RemovalCause::Evicted => "evicted",
            RemovalCause::Cleared => "cleared",
        };
        f.write_str(name)
    }
}

/// Receives every removal from a [`SessionTable`] and decides which sessions
/// may be reclaimed.
///
/// Both methods run inside the table's critical section. They must not call
/// back into the table and must not block.
pub trait SessionObserver<S>: Send + Sync + 'static {
    /// Called exactly once for each session leaving the table, after the key
    /// stops resolving and before the removing call returns. `remaining` is
    /// the number of sessions still in the table.
    fn on_removed(&self, session: &Arc<S>, cause: RemovalCause, remaining: usize);

    /// Whether `session` may be removed to reclaim room.
    fn should_recycle(&self, session: &S) -> bool;
}

/// Maps source ports to live sessions, holding at most `capacity` of them.
///
/// Every `put` first reclaims each session the observer considers recyclable,
/// most idle first. If the table is still full, a finished session is evicted
/// before any live one; among those the least recently active goes first, ties
/// going to the lower source port. A `put` therefore never fails and
/// `size() <= capacity()` always holds.
pub struct SessionTable<S> {
    max_sessions: usize,
    entries: Mutex<FxHashMap<u16, Arc<S>>>,
    observer: Arc<dyn SessionObserver<S>>,
}

impl<S: Session> SessionTable<S> {
    /// Creates an empty table. A capacity of zero is treated as one.
    pub fn new(max_sessions: usize, observer: Arc<dyn SessionObserver<S>>) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            entries: Mutex::new(FxHashMap::default()),
            observer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Inserts `session` under `key`, replacing and reclaiming as needed.
    pub fn put(&self, key: u16, session: Arc<S>) {
        let mut entries = self.lock();

        if let Some(old) = entries.remove(&key) {
            if Arc::ptr_eq(&old, &session) {
                entries.insert(key, old);
                return;
            }
            self.observer
                .on_removed(&old, RemovalCause::Replaced, entries.len());
        }

        self.recycle(&mut entries);

        while entries.len() >= self.max_sessions {
            let Some(victim) = entries
                .iter()
                .min_by_key(|(port, session)| {
                    (!session.is_finished(), session.last_active(), **port)
                })
                .map(|(port, _)| *port)
            else {
                break;
            };
            if let Some(evicted) = entries.remove(&victim) {
                self.observer
                    .on_removed(&evicted, RemovalCause::Evicted, entries.len());
            }
        }

        entries.insert(key, session);
    }

    pub fn get(&self, key: u16) -> Option<Arc<S>> {
        self.lock().get(&key).cloned()
    }

    /// Removes the session under `key`, if any.
    pub fn remove(&self, key: u16) -> Option<Arc<S>> {
        let mut entries = self.lock();
        let session = entries.remove(&key)?;
        self.observer
            .on_removed(&session, RemovalCause::Removed, entries.len());
        Some(session)
    }

    /// Marks the session under `key` finished and removes it.
    pub fn finish(&self, key: u16) -> Option<Arc<S>> {
        let mut entries = self.lock();
        let session = entries.remove(&key)?;
        session.finish();
        self.observer
            .on_removed(&session, RemovalCause::Finished, entries.len());
        Some(session)
    }

    /// Finishes and removes `session` only if it is still the one under
    /// `key`. Returns whether it was removed.
    pub fn release(&self, key: u16, session: &Arc<S>) -> bool {
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }
        if let Some(session) = entries.remove(&key) {
            session.finish();
            self.observer
                .on_removed(&session, RemovalCause::Finished, entries.len());
        }
        true
    }

    /// Removes every session whose recycle predicate holds. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.lock();
        self.recycle(&mut entries)
    }

    /// Removes every session. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let drained: Vec<_> = entries.drain().map(|(_, session)| session).collect();
        let count = drained.len();
        for (i, session) in drained.iter().enumerate() {
            self.observer
                .on_removed(session, RemovalCause::Cleared, count - i - 1);
        }
        count
    }

    fn recycle(&self, entries: &mut FxHashMap<u16, Arc<S>>) -> usize {
        let mut candidates: Vec<_> = entries
            .iter()
            .filter(|(_, session)| self.observer.should_recycle(session))
            .map(|(port, session)| (session.last_active(), *port))
            .collect();
        candidates.sort_unstable();

        let mut recycled = 0;
        for (_, port) in candidates {
            if let Some(session) = entries.remove(&port) {
                self.observer
                    .on_removed(&session, RemovalCause::Recycled, entries.len());
                recycled += 1;
            }
        }
        recycled
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<u16, Arc<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
