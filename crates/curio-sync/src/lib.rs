//! Client-side cache-consistency engine for the Curio catalog dashboard.
//!
//! Keeps a keyed cache of query results correct under three update sources:
//! optimistic mutations, a server-push event stream, and fallback polling.
//!
//! ## Features
//!
//! - **Cache**: keyed store with ordered notifications, snapshots, and rollback
//! - **Event stream**: SSE push connection with geometric reconnect backoff
//! - **Dispatch**: maps push events onto targeted patches or invalidations
//! - **Mutations**: optimistic writes that roll back when the server rejects them
//! - **Polling**: refetch intervals that back off while the push channel is healthy
//! - **Engine**: builder that wires all of the above to a REST API

pub mod actions;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
mod error;
pub mod event;
pub mod key;
pub mod mutation;
pub mod patch;
pub mod polling;
pub mod prefs;
pub mod query;
pub mod sse;
pub mod stream;

#[doc(hidden)]
pub use serde_json as __serde_json;

pub use actions::Actions;
pub use cache::{
    CacheEntry, CacheOptions, CacheUpdate, FetchTicket, MutationSnapshot, ObserverEvent,
    QueryCache, QueryObserver, WriteCause,
};
pub use client::{ApiClient, ApiPath, Transport};
pub use config::{ConfigError, SyncConfig};
pub use dispatch::{DispatchAction, Dispatcher};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ApiError, ApiErrorKind, SyncError};
pub use event::{EntityKind, EventAction, EventKind, InboundEvent};
pub use key::{KeyFilter, QueryKey};
pub use mutation::{Mutation, MutationRunner, MutationTicket};
pub use polling::{ConnectedPolling, PollPolicy, refetch_interval, spawn_poller};
pub use prefs::{PrefsError, PrefsStore, UiPrefs, ViewMode};
pub use query::{FetchOutcome, QueryClient, QueryFetcher};
pub use sse::{SseDecoder, SseEventSource};
pub use stream::{
    ConnectionState, EventSource, EventStreamHandle, MessageStream, ReconnectPolicy, RetryState,
    StreamOptions,
};
