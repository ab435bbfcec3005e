//! Fallback polling while the push channel is unhealthy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::key::QueryKey;
use crate::query::QueryClient;
use crate::stream::ConnectionState;

/// Polling behaviour while the push channel is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedPolling {
    /// Push events keep the query fresh.
    Disabled,
    /// Safety-net refresh at a long interval.
    Every(Duration),
}

/// Per-query polling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Interval while not connected.
    pub interval: Duration,
    pub when_connected: ConnectedPolling,
}

/// Refetch interval for a query given the connection state.
pub fn refetch_interval(state: ConnectionState, policy: &PollPolicy) -> Option<Duration> {
    match (state, policy.when_connected) {
        (ConnectionState::Connected, ConnectedPolling::Disabled) => None,
        (ConnectionState::Connected, ConnectedPolling::Every(interval)) => Some(interval),
        _ => Some(policy.interval),
    }
}

/// Poll `key` while it is observed, re-evaluating the interval on every
/// connection state change.
///
/// The next poll is due one interval after the previous one, whatever states
/// the connection passed through in between. Returning from `connected` to a
/// state whose interval has already elapsed polls immediately. The task ends
/// on shutdown, or when either channel closes.
pub fn spawn_poller(
    client: Arc<QueryClient>,
    key: QueryKey,
    policy: PollPolicy,
    mut state_rx: watch::Receiver<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = refetch_interval(*state_rx.borrow_and_update(), &policy);
        let mut last_poll = Instant::now();
        trace!(key = %key, interval = ?interval, "poller started");

        loop {
            let deadline = interval.map(|interval| last_poll + interval);

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    let next = refetch_interval(state, &policy);
                    if next != interval {
                        trace!(key = %key, state = ?state, interval = ?next, "poller interval changed");
                        interval = next;
                    }
                }

                _ = sleep_until(deadline) => {
                    if client.cache().is_observed(&key) {
                        debug!(key = %key, "polling");
                        // Failures are logged by the client; keep polling.
                        let _ = client.fetch(&key).await;
                    }
                    last_poll = Instant::now();
                }
            }
        }
        debug!(key = %key, "poller stopped");
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
