//! In-memory store of query results.
//!
//! The store maps each [`QueryKey`] to at most one [`CacheEntry`] and is the
//! single shared mutable resource of the engine: the dispatcher, mutation
//! runner, query client, and pollers all mutate it through the operations on
//! [`QueryCache`]. Every write emits a [`CacheUpdate`] while the store lock is
//! held, so subscribers observe writes in exactly the order they were made.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use crate::key::{KeyFilter, QueryKey};

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 4096;

/// Default bound on entries sharing a key root.
pub const DEFAULT_MAX_ENTRIES_PER_ROOT: usize = 256;

/// A cached query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    /// Last known value.
    pub data: Value,
    /// When `data` was last written by a fetch or `set`.
    pub fetched_at: DateTime<Utc>,
    /// Marked by invalidation; cleared by the next fetch or `set`.
    pub is_stale: bool,
}

/// What caused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCause {
    /// Explicit `set`.
    Set,
    /// Completion of a ticketed fetch.
    Fetch,
    /// `update_matching` patch (push event or optimistic update).
    Patch,
    /// Rollback to a snapshot.
    Restore,
    /// Manual or bounded-retention eviction.
    Evict,
}

/// Notification emitted for every observable change.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// An entry was created or replaced.
    Written { entry: CacheEntry, cause: WriteCause },
    /// An entry was removed.
    Removed { key: QueryKey, cause: WriteCause },
    /// An entry became stale. `refetch` is set when the key is observed.
    Invalidated { key: QueryKey, refetch: bool },
}

impl CacheUpdate {
    pub fn key(&self) -> &QueryKey {
        match self {
            CacheUpdate::Written { entry, .. } => &entry.key,
            CacheUpdate::Removed { key, .. } | CacheUpdate::Invalidated { key, .. } => key,
        }
    }
}

/// Prior state of one key inside a [`MutationSnapshot`].
#[derive(Debug, PartialEq)]
pub struct SnapshotEntry {
    pub key: QueryKey,
    /// `None` when the key had no entry.
    pub prior: Option<CacheEntry>,
}

/// Pre-write state of a set of keys, consumed by [`QueryCache::restore`].
///
/// Not `Clone`: a snapshot is used for at most one rollback.
#[derive(Debug, Default, PartialEq)]
pub struct MutationSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl MutationSnapshot {
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.iter().map(|e| &e.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Permission to write the result of one fetch.
///
/// Results are applied only if no cancellation happened since the ticket was
/// issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: QueryKey,
    generation: u64,
}

/// Tunables for the store.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Maximum number of entries sharing a root segment; `None` is unbounded.
    pub max_entries_per_root: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries_per_root: Some(DEFAULT_MAX_ENTRIES_PER_ROOT),
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Logical clock value of the last read or write.
    touched: u64,
}

#[derive(Debug, Default)]
struct FetchState {
    generation: u64,
    in_flight: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<QueryKey, Slot>,
    observers: HashMap<QueryKey, usize>,
    fetches: HashMap<QueryKey, FetchState>,
    clock: u64,
}

impl StoreState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_observed(&self, key: &QueryKey) -> bool {
        self.observers.get(key).is_some_and(|n| *n > 0)
    }

    /// Keys of current entries matching `filter`, in canonical order.
    fn matching_keys(&self, filter: &KeyFilter) -> Vec<QueryKey> {
        let mut keys: Vec<_> = self
            .entries
            .keys()
            .filter(|k| filter.matches(k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Keyed store of query results with ordered change notifications.
pub struct QueryCache {
    state: Mutex<StoreState>,
    options: CacheOptions,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl QueryCache {
    /// Create a new empty cache with default options.
    pub fn new() -> Arc<Self> {
        Self::with_options(CacheOptions::default())
    }

    pub fn with_options(options: CacheOptions) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(StoreState::default()),
            options,
            updates_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    /// Subscribe to every cache update.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    /// Get the entry for `key`.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let mut state = self.lock();
        let now = state.tick();
        state.entries.get_mut(key).map(|slot| {
            slot.touched = now;
            slot.entry.clone()
        })
    }

    /// Get the data for `key`.
    pub fn data(&self, key: &QueryKey) -> Option<Value> {
        self.get(key).map(|entry| entry.data)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// All keys currently cached, in canonical order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.lock().matching_keys(&KeyFilter::All)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Replace or create the entry for `key` and mark it fresh.
    pub fn set(&self, key: QueryKey, data: Value) {
        let mut state = self.lock();
        self.write_fresh(&mut state, key, data, WriteCause::Set);
    }

    fn write_fresh(&self, state: &mut StoreState, key: QueryKey, data: Value, cause: WriteCause) {
        let now = state.tick();
        let entry = CacheEntry {
            key: key.clone(),
            data,
            fetched_at: Utc::now(),
            is_stale: false,
        };
        let created = state
            .entries
            .insert(
                key.clone(),
                Slot {
                    entry: entry.clone(),
                    touched: now,
                },
            )
            .is_none();
        trace!(key = %key, cause = ?cause, "cache: entry written");
        self.broadcast(CacheUpdate::Written { entry, cause });

        if created {
            self.enforce_root_bound(state, &key);
        }
    }

    /// Apply `updater` to every entry matching `filter`.
    ///
    /// The updater returns `None` to leave an entry untouched. Patched entries
    /// keep their `fetched_at` and staleness. Returns the number of entries
    /// written.
    pub fn update_matching<F>(&self, filter: &KeyFilter, mut updater: F) -> usize
    where
        F: FnMut(&QueryKey, &Value) -> Option<Value>,
    {
        let mut state = self.lock();
        let now = state.tick();
        let mut written = 0;
        for key in state.matching_keys(filter) {
            let Some(slot) = state.entries.get_mut(&key) else {
                continue;
            };
            let Some(next) = updater(&key, &slot.entry.data) else {
                continue;
            };
            if next == slot.entry.data {
                continue;
            }
            slot.entry.data = next;
            slot.touched = now;
            written += 1;
            trace!(key = %key, "cache: entry patched");
            self.broadcast(CacheUpdate::Written {
                entry: slot.entry.clone(),
                cause: WriteCause::Patch,
            });
        }
        written
    }

    /// Mark matching entries stale.
    ///
    /// Returns the newly stale keys that are currently observed and therefore
    /// need a re-fetch. Entries that are already stale are left alone.
    pub fn invalidate(&self, filter: &KeyFilter) -> Vec<QueryKey> {
        let mut state = self.lock();
        let mut refetch = Vec::new();
        for key in state.matching_keys(filter) {
            let observed = state.is_observed(&key);
            let Some(slot) = state.entries.get_mut(&key) else {
                continue;
            };
            if slot.entry.is_stale {
                continue;
            }
            slot.entry.is_stale = true;
            trace!(key = %key, observed, "cache: entry invalidated");
            if observed {
                refetch.push(key.clone());
            }
            self.broadcast(CacheUpdate::Invalidated {
                key,
                refetch: observed,
            });
        }
        refetch
    }

    /// Capture the current state of `keys` without altering them.
    pub fn snapshot(&self, keys: &[QueryKey]) -> MutationSnapshot {
        let state = self.lock();
        let mut seen = Vec::with_capacity(keys.len());
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            entries.push(SnapshotEntry {
                key: key.clone(),
                prior: state.entries.get(key).map(|slot| slot.entry.clone()),
            });
        }
        MutationSnapshot { entries }
    }

    /// Capture the current state of every entry matching any of `filters`.
    pub fn snapshot_matching(&self, filters: &[KeyFilter]) -> MutationSnapshot {
        let state = self.lock();
        let mut keys: Vec<QueryKey> = state
            .entries
            .keys()
            .filter(|k| filters.iter().any(|f| f.matches(k)))
            .cloned()
            .collect();
        keys.sort();
        let entries = keys
            .into_iter()
            .map(|key| {
                let prior = state.entries.get(&key).map(|slot| slot.entry.clone());
                SnapshotEntry { key, prior }
            })
            .collect();
        MutationSnapshot { entries }
    }

    /// Write every snapshotted key back to its prior state.
    ///
    /// Overwrites whatever is cached now. Keys that had no entry are removed.
    /// Keys already equal to their prior state are not notified.
    pub fn restore(&self, snapshot: MutationSnapshot) {
        let mut state = self.lock();
        let now = state.tick();
        for SnapshotEntry { key, prior } in snapshot.entries {
            match prior {
                Some(entry) => {
                    let unchanged = state
                        .entries
                        .get(&key)
                        .is_some_and(|slot| slot.entry == entry);
                    if unchanged {
                        continue;
                    }
                    state.entries.insert(
                        key.clone(),
                        Slot {
                            entry: entry.clone(),
                            touched: now,
                        },
                    );
                    trace!(key = %key, "cache: entry restored");
                    self.broadcast(CacheUpdate::Written {
                        entry,
                        cause: WriteCause::Restore,
                    });
                }
                None => {
                    if state.entries.remove(&key).is_some() {
                        trace!(key = %key, "cache: entry removed by restore");
                        self.broadcast(CacheUpdate::Removed {
                            key,
                            cause: WriteCause::Restore,
                        });
                    }
                }
            }
        }
    }

    /// Remove matching entries. Returns the number removed.
    pub fn evict(&self, filter: &KeyFilter) -> usize {
        let mut state = self.lock();
        let keys = state.matching_keys(filter);
        for key in &keys {
            state.entries.remove(key);
            state.fetches.remove(key);
            self.broadcast(CacheUpdate::Removed {
                key: key.clone(),
                cause: WriteCause::Evict,
            });
        }
        if !keys.is_empty() {
            debug!(count = keys.len(), filter = ?filter, "cache: entries evicted");
        }
        keys.len()
    }

    /// Evict least-recently-used unobserved entries sharing `key`'s root.
    fn enforce_root_bound(&self, state: &mut StoreState, key: &QueryKey) {
        let Some(limit) = self.options.max_entries_per_root else {
            return;
        };
        let root = key.root();
        let mut siblings: Vec<(u64, QueryKey)> = state
            .entries
            .iter()
            .filter(|(k, _)| k.root() == root)
            .map(|(k, slot)| (slot.touched, k.clone()))
            .collect();
        if siblings.len() <= limit {
            return;
        }
        siblings.sort();
        let mut excess = siblings.len() - limit;
        for (_, candidate) in siblings {
            if excess == 0 {
                break;
            }
            if &candidate == key || state.is_observed(&candidate) {
                continue;
            }
            state.entries.remove(&candidate);
            state.fetches.remove(&candidate);
            debug!(key = %candidate, "cache: evicted least recently used entry");
            self.broadcast(CacheUpdate::Removed {
                key: candidate,
                cause: WriteCause::Evict,
            });
            excess -= 1;
        }
    }

    /// Start a fetch for `key`.
    ///
    /// Returns `None` when a fetch for the key is already in flight.
    pub fn begin_fetch(&self, key: &QueryKey) -> Option<FetchTicket> {
        let mut state = self.lock();
        let fetch = state.fetches.entry(key.clone()).or_default();
        if fetch.in_flight {
            trace!(key = %key, "cache: fetch already in flight");
            return None;
        }
        fetch.in_flight = true;
        Some(FetchTicket {
            key: key.clone(),
            generation: fetch.generation,
        })
    }

    /// Write a fetch result if the ticket is still current.
    ///
    /// Returns `false` when the fetch was cancelled after the ticket was
    /// issued; the result is discarded.
    pub fn complete_fetch(&self, ticket: FetchTicket, data: Value) -> bool {
        let mut state = self.lock();
        let current = state
            .fetches
            .get_mut(&ticket.key)
            .filter(|fetch| fetch.generation == ticket.generation);
        match current {
            Some(fetch) => {
                fetch.in_flight = false;
                self.write_fresh(&mut state, ticket.key, data, WriteCause::Fetch);
                true
            }
            None => {
                debug!(key = %ticket.key, "cache: discarding superseded fetch result");
                false
            }
        }
    }

    /// Release a ticket whose fetch failed.
    pub fn fail_fetch(&self, ticket: FetchTicket) {
        let mut state = self.lock();
        if let Some(fetch) = state.fetches.get_mut(&ticket.key)
            && fetch.generation == ticket.generation
        {
            fetch.in_flight = false;
        }
    }

    /// Invalidate all outstanding fetch tickets for keys matching `filter`.
    ///
    /// Returns the number of in-flight fetches whose results will be ignored.
    pub fn cancel_fetches(&self, filter: &KeyFilter) -> usize {
        let mut state = self.lock();
        let mut cancelled = 0;
        for (key, fetch) in state.fetches.iter_mut() {
            if !filter.matches(key) {
                continue;
            }
            fetch.generation += 1;
            if fetch.in_flight {
                fetch.in_flight = false;
                cancelled += 1;
                trace!(key = %key, "cache: in-flight fetch cancelled");
            }
        }
        cancelled
    }

    /// Whether a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.lock().fetches.get(key).is_some_and(|f| f.in_flight)
    }

    /// Whether any observer is registered for `key`.
    pub fn is_observed(&self, key: &QueryKey) -> bool {
        self.lock().is_observed(key)
    }

    /// Keys with at least one observer, in canonical order.
    pub fn observed_keys(&self) -> Vec<QueryKey> {
        let state = self.lock();
        let mut keys: Vec<_> = state
            .observers
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Register interest in `key`.
    ///
    /// While the returned observer is alive the key counts as subscribed:
    /// invalidation schedules a re-fetch and retention never evicts it.
    pub fn observe(self: &Arc<Self>, key: QueryKey) -> QueryObserver {
        let mut state = self.lock();
        *state.observers.entry(key.clone()).or_insert(0) += 1;
        let rx = self.updates_tx.subscribe();
        drop(state);
        QueryObserver {
            cache: Arc::clone(self),
            key,
            rx,
        }
    }

    fn release(&self, key: &QueryKey) {
        let mut state = self.lock();
        if let Some(count) = state.observers.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.observers.remove(key);
            }
        }
    }
}

/// Event delivered to a [`QueryObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    /// A change to the observed key.
    Update(CacheUpdate),
    /// Updates were missed; re-read the entry.
    Resync,
}

/// Subscription to a single key. Dropping it unregisters the observer.
pub struct QueryObserver {
    cache: Arc<QueryCache>,
    key: QueryKey,
    rx: broadcast::Receiver<CacheUpdate>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current entry for the observed key.
    pub fn current(&self) -> Option<CacheEntry> {
        self.cache.get(&self.key)
    }

    /// Wait for the next change to the observed key.
    ///
    /// Returns `None` once the cache is gone.
    pub async fn next(&mut self) -> Option<ObserverEvent> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.key() == &self.key => {
                    return Some(ObserverEvent::Update(update));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "observer lagged behind cache updates");
                    return Some(ObserverEvent::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`QueryObserver::next`].
    pub fn try_next(&mut self) -> Option<ObserverEvent> {
        use tokio::sync::broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(update) if update.key() == &self.key => {
                    return Some(ObserverEvent::Update(update));
                }
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => return Some(ObserverEvent::Resync),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
