//! In-flight deduplication registry.
//!
//! Maps a request fingerprint to the single outstanding computation for it. The first
//! caller to insert an entry owns driving it; every other concurrent caller for the same
//! fingerprint awaits the owner's shared outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, Shared};

use crate::fingerprint::RequestKey;
use crate::safety::GovernedResult;

/// Outcome handle that any number of callers can await.
pub type SharedOutcome<T> = Shared<BoxFuture<'static, GovernedResult<T>>>;

struct InFlightEntry<T: Clone> {
    id: u64,
    outcome: SharedOutcome<T>,
}

/// Result of joining the registry for a fingerprint.
pub enum Joined<T: Clone> {
    /// This caller registered the computation.
    Started(SharedOutcome<T>),
    /// An identical computation was already in flight.
    Existing(SharedOutcome<T>),
}

pub struct InFlightRegistry<T: Clone> {
    entries: Arc<DashMap<RequestKey, InFlightEntry<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InFlightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await-handle for `key`, starting the computation if none is registered.
    ///
    /// Insert-if-absent happens under the map's shard lock, so exactly one caller wins the
    /// race for a fingerprint. The winner's `start` receives an [`InFlightSlot`] that must
    /// be moved into the computation: dropping it removes the entry.
    pub fn join_or_start<F>(&self, key: &RequestKey, start: F) -> Joined<T>
    where
        F: FnOnce(InFlightSlot<T>) -> SharedOutcome<T>,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(existing) => Joined::Existing(existing.get().outcome.clone()),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let slot = InFlightSlot {
                    entries: self.entries.clone(),
                    key: key.clone(),
                    id,
                };
                let outcome = start(slot);
                vacant.insert(InFlightEntry {
                    id,
                    outcome: outcome.clone(),
                });
                Joined::Started(outcome)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains_key(key)
    }
}

/// Registry slot owned by the computation for one fingerprint.
///
/// Removes its own entry when dropped, whether the computation finished, failed,
/// panicked or was aborted. A newer entry for the same fingerprint is left alone.
pub struct InFlightSlot<T: Clone> {
    entries: Arc<DashMap<RequestKey, InFlightEntry<T>>>,
    key: RequestKey,
    id: u64,
}

impl<T: Clone> InFlightSlot<T> {
    pub fn key(&self) -> &RequestKey {
        &self.key
    }
}

impl<T: Clone> Drop for InFlightSlot<T> {
    fn drop(&mut self) {
        let id = self.id;
        if self
            .entries
            .remove_if(&self.key, |_, entry| entry.id == id)
            .is_some()
        {
            tracing::trace!(key = %self.key, "Released in-flight slot");
        }
    }
}
