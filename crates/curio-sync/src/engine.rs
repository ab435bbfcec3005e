//! Wiring of cache, push stream, dispatcher, refetching, and polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::actions::Actions;
use crate::cache::{QueryCache, QueryObserver};
use crate::client::{ApiClient, Transport};
use crate::config::SyncConfig;
use crate::dispatch::Dispatcher;
use crate::error::SyncError;
use crate::key::QueryKey;
use crate::mutation::MutationRunner;
use crate::polling::{PollPolicy, spawn_poller};
use crate::query::{QueryClient, QueryFetcher};
use crate::sse::SseEventSource;
use crate::stream::{ConnectionState, EventSource, EventStreamHandle};

/// A running sync engine.
///
/// Owns the cache and every background task. Dropping the engine signals
/// shutdown; call [`SyncEngine::shutdown`] to also wait for the tasks.
pub struct SyncEngine {
    config: SyncConfig,
    cache: Arc<QueryCache>,
    client: Arc<QueryClient>,
    actions: Actions,
    stream: EventStreamHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pollers: Mutex<HashMap<QueryKey, JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn client(&self) -> &Arc<QueryClient> {
        &self.client
    }

    pub fn actions(&self) -> &Actions {
        &self.actions
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.stream.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.stream.subscribe_state()
    }

    /// Observe `key`, fetching it if absent or stale.
    pub fn observe(&self, key: QueryKey) -> QueryObserver {
        self.client.observe(key)
    }

    /// Poll `key` with the configured fallback policy while it is observed.
    pub fn poll(&self, key: QueryKey) {
        self.poll_with(key, self.config.poll.policy());
    }

    /// Poll `key` with `policy`, replacing any poller already running for it.
    pub fn poll_with(&self, key: QueryKey, policy: PollPolicy) {
        let handle = spawn_poller(
            Arc::clone(&self.client),
            key.clone(),
            policy,
            self.stream.subscribe_state(),
            self.shutdown_tx.subscribe(),
        );
        let previous = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), handle);
        if let Some(previous) = previous {
            debug!(key = %key, "replacing poller");
            previous.abort();
        }
    }

    /// Stop polling `key`. Returns whether a poller was running.
    pub fn stop_polling(&self, key: &QueryKey) -> bool {
        let handle = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of keys currently polled.
    pub fn poller_count(&self) -> usize {
        self.pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close the push connection; pollers fall back to their normal interval.
    pub fn disconnect(&self) {
        self.stream.disconnect();
    }

    /// Re-open the push connection with a fresh retry state.
    pub fn reconnect(&self) {
        self.stream.enable();
    }

    /// Disconnect and stop every background task.
    pub async fn shutdown(self) {
        info!("shutting down sync engine");
        self.stream.disconnect();
        self.shutdown_tx.send_replace(true);

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        tasks.extend(
            std::mem::take(&mut *self.pollers.lock().unwrap_or_else(PoisonError::into_inner))
                .into_values(),
        );
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
        info!("sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Builder for [`SyncEngine`].
///
/// Components not supplied explicitly are built from the config: an
/// [`SseEventSource`] for the push channel and one [`ApiClient`] serving as
/// both fetcher and transport.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    cache: Option<Arc<QueryCache>>,
    source: Option<Arc<dyn EventSource>>,
    fetcher: Option<Arc<dyn QueryFetcher>>,
    transport: Option<Arc<dyn Transport>>,
    connect: bool,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            cache: None,
            source: None,
            fetcher: None,
            transport: None,
            connect: true,
        }
    }

    /// Use an existing cache.
    pub fn cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn QueryFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Whether to open the push connection on start (default true).
    pub fn connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    /// Validate the config and start the engine's background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<SyncEngine, SyncError> {
        self.config.validate()?;
        let config = self.config;

        let (fetcher, transport) = match (self.fetcher, self.transport) {
            (Some(fetcher), Some(transport)) => (fetcher, transport),
            (fetcher, transport) => {
                let api = Arc::new(ApiClient::new(&config.api)?);
                (
                    fetcher.unwrap_or_else(|| api.clone() as Arc<dyn QueryFetcher>),
                    transport.unwrap_or_else(|| api.clone() as Arc<dyn Transport>),
                )
            }
        };
        let source: Arc<dyn EventSource> = match self.source {
            Some(source) => source,
            None => Arc::new(SseEventSource::new(
                &config.api.base_url,
                &config.events.path,
                config.api.token.clone(),
                config.api.connect_timeout(),
            )?),
        };

        let cache = self
            .cache
            .unwrap_or_else(|| QueryCache::with_options(config.cache.options()));
        let client = QueryClient::new(Arc::clone(&cache), fetcher);
        let actions = Actions::new(MutationRunner::new(Arc::clone(&cache)), transport);

        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(config.events.channel_capacity);
        let stream = EventStreamHandle::new(source, config.stream_options(), events_tx);

        let tasks = vec![
            tokio::spawn(Dispatcher::new(Arc::clone(&cache)).run(events_rx, shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&client).refetch_loop(shutdown_tx.subscribe())),
        ];

        if self.connect {
            stream.enable();
        }
        info!(base_url = %config.api.base_url, "sync engine started");

        Ok(SyncEngine {
            config,
            cache,
            client,
            actions,
            stream,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            pollers: Mutex::new(HashMap::new()),
        })
    }
}
