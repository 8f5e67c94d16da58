//! Deduplication registries shared by every chain.
//!
//! `OngoingTransfers` tracks uids with a fetch in flight, `CompletedCache`
//! tracks uids fetched during this process's lifetime. Each wraps its own
//! lock; neither lock is held across an await point.

use crate::message::Message;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The process-wide registries, injected into every listener and transfer
/// protocol so all chains share one view of in-flight and completed uids.
#[derive(Debug, Clone, Default)]
pub struct Registries {
    pub ongoing: Arc<OngoingTransfers>,
    pub completed: Arc<CompletedCache>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Ongoing transfers
// =============================================================================

#[derive(Debug)]
struct Entry {
    generation: u64,
    requests: Vec<Message>,
}

#[derive(Debug, Default)]
struct Transfers {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Map of uid -> requests waiting on the in-flight fetch of that uid.
#[derive(Debug, Default)]
pub struct OngoingTransfers {
    inner: Mutex<Transfers>,
}

impl OngoingTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    // Map updates are single statements, so a poisoned lock still guards a
    // consistent map.
    fn lock(&self) -> MutexGuard<'_, Transfers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request for `uid`.
    ///
    /// Returns a guard when this caller becomes the driver of the fetch.
    /// Returns `None` when a driver already exists; the message is queued
    /// behind it.
    pub fn add_if_absent(self: &Arc<Self>, uid: &str, message: Message) -> Option<TransferGuard> {
        let mut transfers = self.lock();
        if let Some(entry) = transfers.entries.get_mut(uid) {
            entry.requests.push(message);
            return None;
        }

        let generation = transfers.next_generation;
        transfers.next_generation += 1;
        transfers.entries.insert(
            uid.to_string(),
            Entry {
                generation,
                requests: vec![message],
            },
        );

        Some(TransferGuard {
            registry: Arc::clone(self),
            uid: uid.to_string(),
            generation,
            released: false,
        })
    }

    /// Remove the entry for `uid`, returning every request that was queued on it.
    pub fn resolve(&self, uid: &str) -> Vec<Message> {
        self.lock()
            .entries
            .remove(uid)
            .map(|entry| entry.requests)
            .unwrap_or_default()
    }

    fn resolve_generation(&self, uid: &str, generation: u64) -> Vec<Message> {
        let mut transfers = self.lock();
        match transfers.entries.get(uid) {
            Some(entry) if entry.generation == generation => transfers
                .entries
                .remove(uid)
                .map(|entry| entry.requests)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.lock().entries.contains_key(uid)
    }

    /// Number of requests queued for `uid`, driver included.
    pub fn pending(&self, uid: &str) -> usize {
        self.lock()
            .entries
            .get(uid)
            .map_or(0, |entry| entry.requests.len())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

/// Ownership of one uid's in-flight fetch.
///
/// Dropping the guard without calling [`TransferGuard::complete`] releases
/// the entry, so cancelled or aborted fetches never leave a uid stuck.
/// A guard only ever removes the entry it created: if the uid was resolved
/// externally and re-registered, the stale guard leaves the new entry alone.
#[derive(Debug)]
pub struct TransferGuard {
    registry: Arc<OngoingTransfers>,
    uid: String,
    generation: u64,
    released: bool,
}

impl TransferGuard {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Release the entry and hand back every queued request, driver first.
    pub fn complete(mut self) -> Vec<Message> {
        self.released = true;
        self.registry.resolve_generation(&self.uid, self.generation)
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.released {
            self.registry.resolve_generation(&self.uid, self.generation);
        }
    }
}

// =============================================================================
// Completed transfers
// =============================================================================

/// Set of uids already fetched. Grows monotonically.
#[derive(Debug, Default)]
pub struct CompletedCache {
    uids: Mutex<HashSet<String>>,
}

impl CompletedCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.uids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.lock().contains(uid)
    }

    /// Record `uid`. Returns false if it was already present.
    pub fn add(&self, uid: &str) -> bool {
        let mut uids = self.lock();
        if uids.contains(uid) {
            return false;
        }
        uids.insert(uid.to_string())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
