//! Optimistic mutations with rollback.
//!
//! A [`Mutation`] describes which cache entries a write touches and how to
//! patch them speculatively, plus which related keys to refresh once it
//! settles. [`MutationRunner::run`] applies it:
//!
//! 1. cancel in-flight fetches for the affected keys,
//! 2. snapshot the affected keys,
//! 3. apply the optimistic patch,
//! 4. await the network request on its own task,
//! 5. on success drop the snapshot and mark the affected keys stale,
//! 6. on failure restore the snapshot and return the error,
//! 7. in both cases invalidate the settle keys.
//!
//! Steps 1-3 run before `run` returns, so observers see the speculative
//! state immediately. Steps 4-7 run on a spawned task: dropping the returned
//! [`MutationTicket`] never strands the cache in its speculative state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{MutationSnapshot, QueryCache};
use crate::error::{ApiError, SyncError};
use crate::key::{KeyFilter, QueryKey};

type Updater = Box<dyn FnMut(&QueryKey, &Value) -> Option<Value> + Send>;

struct OptimisticUpdate {
    filter: KeyFilter,
    updater: Updater,
}

/// Description of an optimistic write.
pub struct Mutation {
    name: &'static str,
    updates: Vec<OptimisticUpdate>,
    settle: Vec<KeyFilter>,
}

impl Mutation {
    /// Start describing a mutation; `name` is used in logs.
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            updates: Vec::new(),
            settle: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Patch entries matching `filter`. The updater returns `None` to leave an
    /// entry unchanged.
    pub fn update<F>(mut self, filter: KeyFilter, updater: F) -> Self
    where
        F: FnMut(&QueryKey, &Value) -> Option<Value> + Send + 'static,
    {
        self.updates.push(OptimisticUpdate {
            filter,
            updater: Box::new(updater),
        });
        self
    }

    /// Invalidate entries matching `filter` once the mutation settles.
    pub fn settle(mut self, filter: KeyFilter) -> Self {
        self.settle.push(filter);
        self
    }

    fn affected(&self) -> Vec<KeyFilter> {
        self.updates.iter().map(|u| u.filter.clone()).collect()
    }
}

/// Applies [`Mutation`]s against a cache.
#[derive(Clone)]
pub struct MutationRunner {
    cache: Arc<QueryCache>,
}

impl MutationRunner {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self { cache }
    }

    /// Apply `mutation` optimistically and settle it once `request` resolves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run<T, Fut>(&self, mutation: Mutation, request: Fut) -> MutationTicket<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let affected = mutation.affected();
        let Mutation {
            name,
            updates,
            settle,
        } = mutation;

        for filter in &affected {
            let cancelled = self.cache.cancel_fetches(filter);
            if cancelled > 0 {
                debug!(mutation = name, cancelled, "cancelled in-flight fetches");
            }
        }
        let snapshot = self.cache.snapshot_matching(&affected);
        let mut patched = 0;
        for OptimisticUpdate { filter, mut updater } in updates {
            patched += self.cache.update_matching(&filter, &mut updater);
        }
        debug!(mutation = name, snapshotted = snapshot.len(), patched, "optimistic update applied");

        let cache = Arc::clone(&self.cache);
        let handle = tokio::spawn(async move {
            let result = request.await;
            settle_mutation(&cache, name, snapshot, &affected, &settle, result)
        });
        MutationTicket { handle }
    }
}

fn settle_mutation<T>(
    cache: &QueryCache,
    name: &'static str,
    snapshot: MutationSnapshot,
    affected: &[KeyFilter],
    settle: &[KeyFilter],
    result: Result<T, ApiError>,
) -> Result<T, SyncError> {
    let result = match result {
        Ok(value) => {
            drop(snapshot);
            for filter in affected {
                cache.invalidate(filter);
            }
            info!(mutation = name, "mutation committed");
            Ok(value)
        }
        Err(e) => {
            cache.restore(snapshot);
            warn!(mutation = name, error = %e, "mutation rejected, rolled back");
            Err(SyncError::Api(e))
        }
    };
    for filter in settle {
        cache.invalidate(filter);
    }
    result
}

/// Result handle for a running mutation.
///
/// Awaiting it yields the server's response or the rejection. Dropping it
/// abandons interest; the mutation still settles.
pub struct MutationTicket<T> {
    handle: JoinHandle<Result<T, SyncError>>,
}

impl<T> Future for MutationTicket<T> {
    type Output = Result<T, SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError::MutationAborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}
