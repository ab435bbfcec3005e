//! Long-lived push connection with reconnection.
//!
//! One [`EventStreamHandle`] owns at most one session task at a time. The
//! session walks the connection state machine:
//!
//! ```text
//! disconnected -> connecting -> connected -> reconnecting -> connecting -> ...
//! ```
//!
//! and forwards every parsed message to the dispatcher over a bounded
//! channel. It never touches the cache. `disconnect()` forces `disconnected`
//! and disposes the session: a disposed session publishes nothing further,
//! even if a retry timer or connection attempt resolves afterwards.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SyncError;
use crate::event::{EventKind, InboundEvent};

/// Raw message bodies from an open push connection.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String, SyncError>> + Send>>;

/// Transport that can open a push connection.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a connection. The returned stream ends or errors when it drops.
    async fn connect(&self) -> Result<MessageStream, SyncError>;
}

/// Health of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retrying after a previously connected session dropped.
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Geometric backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// `min(initial * multiplier^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        let max_nanos = self.max.as_nanos() as f64;
        if nanos.is_finite() && nanos < max_nanos {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            self.max
        }
    }
}

/// Retry bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Consecutive failures since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt count.
    pub fn delay(&self) -> Duration {
        self.policy.delay_for(self.attempt)
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn on_failure(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay()
    }

    /// Record a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Session tunables.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub reconnect: ReconnectPolicy,
    /// A connection silent for this long counts as dropped.
    pub read_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            read_timeout: Duration::from_secs(45),
        }
    }
}

struct Shared {
    source: Arc<dyn EventSource>,
    options: StreamOptions,
    events_tx: mpsc::Sender<InboundEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

struct Session {
    disposed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Control handle for the push connection. Dropping it disconnects.
pub struct EventStreamHandle {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl EventStreamHandle {
    /// Create a disabled handle. Call [`EventStreamHandle::enable`] to connect.
    pub fn new(
        source: Arc<dyn EventSource>,
        options: StreamOptions,
        events_tx: mpsc::Sender<InboundEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                source,
                options,
                events_tx,
                state_tx,
            }),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start a fresh session with a fresh retry state. No-op while enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enable(&self) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            return;
        }

        let disposed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(
            Arc::clone(&self.shared),
            Arc::clone(&disposed),
            shutdown_rx,
        ));
        info!("event stream enabled");
        *session = Some(Session {
            disposed,
            shutdown_tx,
            task,
        });
    }

    /// Tear down the session and force `disconnected`.
    ///
    /// Terminal until [`EventStreamHandle::enable`] is called again.
    pub fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.disposed.store(true, Ordering::SeqCst);
            let _ = session.shutdown_tx.send(true);
            session.task.abort();
            info!("event stream disconnected");
        }
        self.shared.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected {
                return false;
            }
            *current = ConnectionState::Disconnected;
            true
        });
    }
}

impl Drop for EventStreamHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Publish `next` unless the session was disposed.
fn publish(shared: &Shared, disposed: &AtomicBool, next: ConnectionState) {
    shared.state_tx.send_if_modified(|current| {
        if disposed.load(Ordering::SeqCst) || *current == next {
            return false;
        }
        debug!(from = ?*current, to = ?next, "connection state changed");
        *current = next;
        true
    });
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

async fn run_session(
    shared: Arc<Shared>,
    disposed: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let is_disposed = || disposed.load(Ordering::SeqCst);
    let mut retry = RetryState::new(shared.options.reconnect);
    let mut ever_connected = false;

    publish(&shared, &disposed, ConnectionState::Connecting);

    loop {
        if is_disposed() {
            return;
        }

        let attempt = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => return,
            result = shared.source.connect() => result,
        };
        if is_disposed() {
            return;
        }

        match attempt {
            Ok(messages) => {
                retry.reset();
                ever_connected = true;
                publish(&shared, &disposed, ConnectionState::Connected);
                info!("event stream connected");

                match pump(&shared, &disposed, messages, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Dropped(reason) => {
                        warn!(reason = %reason, "event stream dropped");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, attempt = retry.attempt() + 1, "event stream connect failed");
            }
        }
        if is_disposed() {
            return;
        }

        let waiting = if ever_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        publish(&shared, &disposed, waiting);

        let delay = retry.on_failure();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = retry.attempt(),
            "retrying event stream"
        );
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if is_disposed() {
            return;
        }
        publish(&shared, &disposed, ConnectionState::Connecting);
    }
}

/// Forward messages until the connection drops or shutdown is signalled.
async fn pump(
    shared: &Shared,
    disposed: &AtomicBool,
    mut messages: MessageStream,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let read_timeout = shared.options.read_timeout;
    loop {
        let next = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => return SessionEnd::Shutdown,
            next = tokio::time::timeout(read_timeout, messages.next()) => next,
        };
        if disposed.load(Ordering::SeqCst) {
            return SessionEnd::Shutdown;
        }

        let text = match next {
            Ok(Some(Ok(text))) => text,
            Ok(Some(Err(e))) => return SessionEnd::Dropped(e.to_string()),
            Ok(None) => return SessionEnd::Dropped("stream ended".to_string()),
            Err(_) => {
                return SessionEnd::Dropped(format!(
                    "no message within {}ms",
                    read_timeout.as_millis()
                ));
            }
        };

        let event = match InboundEvent::parse(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "discarding malformed event");
                continue;
            }
        };
        if event.kind() == EventKind::Heartbeat {
            trace!("heartbeat");
        }
        if shared.events_tx.send(event).await.is_err() {
            debug!("dispatcher gone, closing event stream");
            return SessionEnd::Shutdown;
        }
    }
}
