//! Fetching query results into the cache.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheUpdate, QueryCache, QueryObserver};
use crate::error::ApiError;
use crate::key::QueryKey;

/// Source of authoritative query results.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, ApiError>;
}

/// What happened to a fetch result.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Written to the cache.
    Applied(Value),
    /// Cancelled while in flight; the cache was left alone.
    Discarded(Value),
    /// Another fetch for the key was already running.
    InFlight,
}

/// Runs fetches against a [`QueryFetcher`] and writes results to the cache.
pub struct QueryClient {
    cache: Arc<QueryCache>,
    fetcher: Arc<dyn QueryFetcher>,
}

impl QueryClient {
    pub fn new(cache: Arc<QueryCache>, fetcher: Arc<dyn QueryFetcher>) -> Arc<Self> {
        Arc::new(Self { cache, fetcher })
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Fetch `key` under a ticket.
    ///
    /// The result is written only if no mutation cancelled the fetch in the
    /// meantime. Failures leave the existing entry untouched.
    pub async fn fetch(&self, key: &QueryKey) -> Result<FetchOutcome, ApiError> {
        let Some(ticket) = self.cache.begin_fetch(key) else {
            return Ok(FetchOutcome::InFlight);
        };
        trace!(key = %key, "fetching");
        match self.fetcher.fetch(key).await {
            Ok(data) => {
                if self.cache.complete_fetch(ticket, data.clone()) {
                    Ok(FetchOutcome::Applied(data))
                } else {
                    Ok(FetchOutcome::Discarded(data))
                }
            }
            Err(e) => {
                self.cache.fail_fetch(ticket);
                warn!(key = %key, error = %e, "fetch failed");
                Err(e)
            }
        }
    }

    /// Return fresh cached data, fetching when absent or stale.
    pub async fn ensure(&self, key: &QueryKey) -> Result<Value, ApiError> {
        if let Some(entry) = self.cache.get(key)
            && !entry.is_stale
        {
            return Ok(entry.data);
        }
        match self.fetch(key).await? {
            FetchOutcome::Applied(data) => Ok(data),
            // A mutation owns the entry right now; prefer its view.
            FetchOutcome::Discarded(data) => Ok(self.cache.data(key).unwrap_or(data)),
            FetchOutcome::InFlight => match self.cache.data(key) {
                Some(data) => Ok(data),
                None => self.fetcher.fetch(key).await,
            },
        }
    }

    /// Register an observer and fetch in the background if needed.
    pub fn observe(self: &Arc<Self>, key: QueryKey) -> QueryObserver {
        let observer = self.cache.observe(key.clone());
        let needs_fetch = self.cache.get(&key).is_none_or(|entry| entry.is_stale);
        if needs_fetch {
            self.spawn_fetch(key);
        }
        observer
    }

    fn spawn_fetch(self: &Arc<Self>, key: QueryKey) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are already logged by `fetch`.
            let _ = client.fetch(&key).await;
        });
    }

    /// Re-fetch every observed key that is missing or stale.
    ///
    /// Returns the number of fetches whose results were applied.
    pub async fn refetch_stale_observed(&self) -> usize {
        let keys: Vec<QueryKey> = self
            .cache
            .observed_keys()
            .into_iter()
            .filter(|key| self.cache.get(key).is_none_or(|entry| entry.is_stale))
            .collect();
        if keys.is_empty() {
            return 0;
        }
        debug!(count = keys.len(), "re-fetching stale observed queries");
        let results = join_all(keys.iter().map(|key| self.fetch(key))).await;
        results
            .into_iter()
            .filter(|r| matches!(r, Ok(FetchOutcome::Applied(_))))
            .count()
    }

    /// Re-fetch observed keys as soon as they are invalidated.
    ///
    /// Ends on shutdown or when the shutdown sender is dropped.
    pub async fn refetch_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut updates = self.cache.subscribe();
        info!("refetch loop started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                update = updates.recv() => match update {
                    Ok(CacheUpdate::Invalidated { key, refetch: true }) => {
                        self.spawn_fetch(key);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "refetch loop lagged, sweeping stale observed queries");
                        let client = Arc::clone(&self);
                        tokio::spawn(async move {
                            client.refetch_stale_observed().await;
                        });
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("refetch loop stopped");
    }
}
