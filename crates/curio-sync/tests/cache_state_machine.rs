//! Stateful property testing for the query cache.
//!
//! Drives `QueryCache` with random sequences of writes, patches,
//! invalidations, snapshots, restores, evictions, and observer churn, and
//! checks it against a plain reference model after every step:
//!
//! - entry data and staleness match the model
//! - each operation emits exactly the expected number of notifications
//! - invalidation reports exactly the observed keys that became stale
//! - restoring a snapshot returns every captured key to its prior state

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use curio_sync::cache::{CacheOptions, CacheUpdate, MutationSnapshot, QueryCache, QueryObserver};
use curio_sync::key::{KeyFilter, QueryKey};
use curio_sync::query_key;
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::{Value, json};
use tokio::sync::broadcast;

/// Size of the key universe: three `queue` keys and three `items` keys.
const KEYS: u8 = 6;

fn key(index: u8) -> QueryKey {
    if index < 3 {
        query_key!["queue", { "page": index }]
    } else {
        query_key!["items", { "page": (index - 3) }]
    }
}

/// Filter over the key universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterModel {
    All,
    Queue,
    Items,
    Exact(u8),
}

impl FilterModel {
    fn matches(self, index: u8) -> bool {
        match self {
            Self::All => true,
            Self::Queue => index < 3,
            Self::Items => index >= 3,
            Self::Exact(i) => i == index,
        }
    }

    fn to_filter(self) -> KeyFilter {
        match self {
            Self::All => KeyFilter::All,
            Self::Queue => KeyFilter::root("queue"),
            Self::Items => KeyFilter::prefix(query_key!["items"]),
            Self::Exact(i) => KeyFilter::exact(key(i)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheOperation {
    Set { key: u8, value: i64 },
    /// Add `delta` to every matching entry; zero leaves entries unchanged.
    Patch { filter: FilterModel, delta: i64 },
    Invalidate { filter: FilterModel },
    Evict { filter: FilterModel },
    Snapshot { keys: Vec<u8> },
    Restore,
    Observe { key: u8 },
    Release { key: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelEntry {
    pub value: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CacheModel {
    pub entries: BTreeMap<u8, ModelEntry>,
    pub observers: BTreeMap<u8, usize>,
    pub snapshots: Vec<Vec<(u8, Option<ModelEntry>)>>,
    /// Notifications the last operation should emit; `None` when not checked.
    pub expected_notifications: Option<usize>,
    /// Keys the last invalidation should report for re-fetch.
    pub expected_refetch: BTreeSet<u8>,
}

impl CacheModel {
    fn is_observed(&self, index: u8) -> bool {
        self.observers.get(&index).is_some_and(|n| *n > 0)
    }
}

fn filter_strategy() -> impl Strategy<Value = FilterModel> {
    prop_oneof![
        Just(FilterModel::All),
        Just(FilterModel::Queue),
        Just(FilterModel::Items),
        (0..KEYS).prop_map(FilterModel::Exact),
    ]
}

impl ReferenceStateMachine for CacheModel {
    type State = Self;
    type Transition = CacheOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let observed: Vec<u8> = state
            .observers
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(k, _)| *k)
            .collect();

        let common = prop_oneof![
            4 => (0..KEYS, -5i64..5).prop_map(|(key, value)| CacheOperation::Set { key, value }),
            2 => (filter_strategy(), -2i64..3).prop_map(|(filter, delta)| CacheOperation::Patch { filter, delta }),
            3 => filter_strategy().prop_map(|filter| CacheOperation::Invalidate { filter }),
            1 => filter_strategy().prop_map(|filter| CacheOperation::Evict { filter }),
            2 => proptest::collection::vec(0..KEYS, 1..4).prop_map(|keys| CacheOperation::Snapshot { keys }),
            2 => Just(CacheOperation::Restore),
            2 => (0..KEYS).prop_map(|key| CacheOperation::Observe { key }),
        ];

        if observed.is_empty() {
            common.boxed()
        } else {
            prop_oneof![
                9 => common,
                1 => proptest::sample::select(observed).prop_map(|key| CacheOperation::Release { key }),
            ]
            .boxed()
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        state.expected_refetch.clear();
        match transition {
            CacheOperation::Set { key, value } => {
                state.entries.insert(
                    *key,
                    ModelEntry {
                        value: *value,
                        stale: false,
                    },
                );
                state.expected_notifications = Some(1);
            }
            CacheOperation::Patch { filter, delta } => {
                let mut written = 0;
                for (index, entry) in state.entries.iter_mut() {
                    if filter.matches(*index) && *delta != 0 {
                        entry.value += delta;
                        written += 1;
                    }
                }
                state.expected_notifications = Some(written);
            }
            CacheOperation::Invalidate { filter } => {
                let mut written = 0;
                let mut refetch = BTreeSet::new();
                for (index, entry) in state.entries.iter_mut() {
                    if filter.matches(*index) && !entry.stale {
                        entry.stale = true;
                        written += 1;
                        refetch.insert(*index);
                    }
                }
                refetch.retain(|index| state.is_observed(*index));
                state.expected_refetch = refetch;
                state.expected_notifications = Some(written);
            }
            CacheOperation::Evict { filter } => {
                let before = state.entries.len();
                state.entries.retain(|index, _| !filter.matches(*index));
                state.expected_notifications = Some(before - state.entries.len());
            }
            CacheOperation::Snapshot { keys } => {
                let mut seen = BTreeSet::new();
                let captured = keys
                    .iter()
                    .filter(|k| seen.insert(**k))
                    .map(|k| (*k, state.entries.get(k).copied()))
                    .collect();
                state.snapshots.push(captured);
                state.expected_notifications = Some(0);
            }
            CacheOperation::Restore => {
                if let Some(snapshot) = state.snapshots.pop() {
                    for (index, prior) in snapshot {
                        match prior {
                            Some(entry) => {
                                state.entries.insert(index, entry);
                            }
                            None => {
                                state.entries.remove(&index);
                            }
                        }
                    }
                }
                // Timestamps are not modelled, so equality-skipping is not checked here.
                state.expected_notifications = None;
            }
            CacheOperation::Observe { key } => {
                *state.observers.entry(*key).or_insert(0) += 1;
                state.expected_notifications = Some(0);
            }
            CacheOperation::Release { key } => {
                if let Some(n) = state.observers.get_mut(key) {
                    *n -= 1;
                }
                state.expected_notifications = Some(0);
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            CacheOperation::Release { key } => state.is_observed(*key),
            _ => true,
        }
    }
}

pub struct CacheHarness {
    cache: Arc<QueryCache>,
    updates: broadcast::Receiver<CacheUpdate>,
    snapshots: Vec<MutationSnapshot>,
    observers: Vec<QueryObserver>,
    last_refetch: BTreeSet<QueryKey>,
}

impl CacheHarness {
    fn new() -> Self {
        let cache = QueryCache::with_options(CacheOptions {
            max_entries_per_root: None,
        });
        let updates = cache.subscribe();
        Self {
            cache,
            updates,
            snapshots: Vec::new(),
            observers: Vec::new(),
            last_refetch: BTreeSet::new(),
        }
    }

    fn apply_operation(&mut self, op: &CacheOperation) {
        self.last_refetch.clear();
        match op {
            CacheOperation::Set { key: index, value } => {
                self.cache.set(key(*index), json!(value));
            }
            CacheOperation::Patch { filter, delta } => {
                let delta = *delta;
                self.cache.update_matching(&filter.to_filter(), |_, data| {
                    data.as_i64().map(|n| json!(n + delta))
                });
            }
            CacheOperation::Invalidate { filter } => {
                self.last_refetch = self.cache.invalidate(&filter.to_filter()).into_iter().collect();
            }
            CacheOperation::Evict { filter } => {
                self.cache.evict(&filter.to_filter());
            }
            CacheOperation::Snapshot { keys } => {
                let keys: Vec<QueryKey> = keys.iter().map(|i| key(*i)).collect();
                self.snapshots.push(self.cache.snapshot(&keys));
            }
            CacheOperation::Restore => {
                if let Some(snapshot) = self.snapshots.pop() {
                    self.cache.restore(snapshot);
                }
            }
            CacheOperation::Observe { key: index } => {
                self.observers.push(self.cache.observe(key(*index)));
            }
            CacheOperation::Release { key: index } => {
                let target = key(*index);
                if let Some(pos) = self.observers.iter().position(|o| o.key() == &target) {
                    self.observers.swap_remove(pos);
                }
            }
        }
    }

    fn drain_notifications(&mut self) -> usize {
        let mut count = 0;
        while self.updates.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    fn verify_invariants(&mut self, model: &CacheModel) {
        for index in 0..KEYS {
            let actual = self.cache.get(&key(index));
            match (model.entries.get(&index), actual) {
                (None, None) => {}
                (Some(expected), Some(entry)) => {
                    assert_eq!(entry.data, Value::from(expected.value), "data of {}", key(index));
                    assert_eq!(entry.is_stale, expected.stale, "staleness of {}", key(index));
                }
                (expected, actual) => {
                    panic!("entry mismatch for {}: model {:?}, cache {:?}", key(index), expected, actual)
                }
            }
            assert_eq!(
                self.cache.is_observed(&key(index)),
                model.is_observed(index),
                "observer state of {}",
                key(index)
            );
        }
        assert_eq!(self.cache.len(), model.entries.len());

        let expected_refetch: BTreeSet<QueryKey> =
            model.expected_refetch.iter().map(|i| key(*i)).collect();
        assert_eq!(self.last_refetch, expected_refetch);

        let notifications = self.drain_notifications();
        if let Some(expected) = model.expected_notifications {
            assert_eq!(notifications, expected, "notification count");
        }
    }
}

impl StateMachineTest for CacheHarness {
    type SystemUnderTest = Self;
    type Reference = CacheModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn cache_state_machine_test(sequential 1..50 => CacheHarness);
}

// Targeted properties

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Restoring any snapshot returns every captured key to exactly its prior
    /// entry, whatever happened in between.
    #[test]
    fn restore_returns_captured_keys_to_prior_state(
        initial in proptest::collection::btree_map(0..KEYS, -5i64..5, 0..6),
        captured in proptest::collection::btree_set(0..KEYS, 1..6),
        writes in proptest::collection::vec((0..KEYS, -5i64..5), 0..10),
        invalidate_all in any::<bool>(),
    ) {
        let cache = QueryCache::new();
        for (index, value) in &initial {
            cache.set(key(*index), json!(value));
        }
        let keys: Vec<QueryKey> = captured.iter().map(|i| key(*i)).collect();
        let before: Vec<_> = keys.iter().map(|k| cache.get(k)).collect();
        let snapshot = cache.snapshot(&keys);

        for (index, value) in &writes {
            cache.set(key(*index), json!(value));
        }
        if invalidate_all {
            cache.invalidate(&KeyFilter::All);
        }
        cache.restore(snapshot);

        let after: Vec<_> = keys.iter().map(|k| cache.get(k)).collect();
        prop_assert_eq!(before, after);
    }

    /// Invalidating twice is the same as invalidating once.
    #[test]
    fn invalidate_is_idempotent(
        initial in proptest::collection::btree_map(0..KEYS, -5i64..5, 0..6),
        filter in filter_strategy(),
    ) {
        let cache = QueryCache::new();
        for (index, value) in &initial {
            cache.set(key(*index), json!(value));
        }
        cache.invalidate(&filter.to_filter());
        let once: Vec<_> = cache.keys().iter().map(|k| cache.get(k)).collect();

        let mut updates = cache.subscribe();
        cache.invalidate(&filter.to_filter());
        let twice: Vec<_> = cache.keys().iter().map(|k| cache.get(k)).collect();

        prop_assert_eq!(once, twice);
        prop_assert!(updates.try_recv().is_err());
    }
}
