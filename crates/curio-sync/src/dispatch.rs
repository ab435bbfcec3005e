//! Translation of push events into cache operations.
//!
//! Every event type maps to exactly one of:
//! - a targeted patch of the entries that contain the entity (`*.progress`),
//! - an invalidation of the entity's listings, detail, and aggregate stats
//!   (created, status, completed, failed, cancelled, deleted),
//! - nothing (`heartbeat` and anything unrecognized).
//!
//! Query key roots for each entity family come from the route table below.
//! Adding an entity family means adding an [`EntityKind`] variant and one
//! line to `define_entity_routes!`.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::cache::QueryCache;
use crate::event::{EntityKind, EventAction, EventKind, InboundEvent};
use crate::key::{KeyFilter, QueryKey};
use crate::patch::merge_entity;

/// Query key roots owned by one entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRoutes {
    /// Root of listing queries, e.g. `["queue", {..filters}]`.
    pub list: &'static str,
    /// Root of detail queries, e.g. `["job", "J1"]`.
    pub detail: &'static str,
    /// Root of aggregate count queries.
    pub stats: &'static str,
}

macro_rules! define_entity_routes {
    ($($entity:path => list $list:literal, detail $detail:literal, stats $stats:literal;)*) => {
        /// Key roots for an entity family.
        pub fn routes_for(entity: EntityKind) -> EntityRoutes {
            match entity {
                $($entity => EntityRoutes { list: $list, detail: $detail, stats: $stats },)*
            }
        }
    };
}

define_entity_routes! {
    EntityKind::Job => list "queue", detail "job", stats "queue-stats";
    EntityKind::Item => list "items", detail "item", stats "catalog-stats";
}

impl EntityRoutes {
    /// Filter for every listing query of this family.
    pub fn lists(&self) -> KeyFilter {
        KeyFilter::root(self.list)
    }

    /// Filter for every query about one entity's detail.
    pub fn detail_of(&self, id: &Value) -> KeyFilter {
        KeyFilter::prefix(self.detail_key(id))
    }

    pub fn detail_key(&self, id: &Value) -> QueryKey {
        QueryKey::root_only(self.detail).with(id.clone())
    }

    /// Filter for aggregate count queries.
    pub fn stats(&self) -> KeyFilter {
        KeyFilter::root(self.stats)
    }
}

/// The cache operation an event maps to.
#[derive(Debug, Clone)]
pub enum DispatchAction {
    /// Merge `fields` into entity `id` wherever it appears under `targets`.
    Patch {
        targets: Vec<KeyFilter>,
        id: Value,
        fields: Map<String, Value>,
    },
    /// Mark everything matching these filters stale.
    Invalidate(Vec<KeyFilter>),
    /// No cache action.
    Ignore,
}

/// Decide what to do with an event. Total over all event types.
pub fn plan(event: &InboundEvent) -> DispatchAction {
    let EventKind::Entity { entity, action } = event.kind() else {
        return DispatchAction::Ignore;
    };
    let routes = routes_for(entity);
    let id = event.entity_id().cloned();

    match action {
        EventAction::Progress => match id {
            Some(id) => DispatchAction::Patch {
                targets: vec![routes.lists(), routes.detail_of(&id)],
                fields: event.patch_fields(),
                id,
            },
            // Nothing to locate; fall back to refreshing the listings.
            None => DispatchAction::Invalidate(vec![routes.lists()]),
        },
        EventAction::Created
        | EventAction::Status
        | EventAction::Completed
        | EventAction::Failed
        | EventAction::Cancelled
        | EventAction::Deleted => {
            let mut filters = vec![routes.lists()];
            if let Some(id) = &id {
                filters.push(routes.detail_of(id));
            }
            filters.push(routes.stats());
            DispatchAction::Invalidate(filters)
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Entries rewritten by a patch.
    pub patched: usize,
    /// Observed keys that became stale and need a re-fetch.
    pub refetch: Vec<QueryKey>,
}

/// Apply an event to the cache.
pub fn apply(cache: &QueryCache, event: &InboundEvent) -> DispatchOutcome {
    match plan(event) {
        DispatchAction::Patch {
            targets,
            id,
            fields,
        } => {
            let mut patched = 0;
            for filter in &targets {
                patched += cache.update_matching(filter, |_, data| merge_entity(data, &id, &fields));
            }
            trace!(event_type = %event.event_type, id = %id, patched, "dispatch: patched entries");
            DispatchOutcome {
                patched,
                refetch: Vec::new(),
            }
        }
        DispatchAction::Invalidate(filters) => {
            let mut refetch = Vec::new();
            for filter in &filters {
                refetch.extend(cache.invalidate(filter));
            }
            trace!(event_type = %event.event_type, stale = refetch.len(), "dispatch: invalidated");
            DispatchOutcome {
                patched: 0,
                refetch,
            }
        }
        DispatchAction::Ignore => {
            trace!(event_type = %event.event_type, "dispatch: ignored");
            DispatchOutcome::default()
        }
    }
}

/// Consumes inbound events in receipt order and applies them to the cache.
pub struct Dispatcher {
    cache: Arc<QueryCache>,
}

impl Dispatcher {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self { cache }
    }

    /// Run until the event channel closes, shutdown is signalled, or the
    /// shutdown sender is dropped.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<InboundEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("event dispatcher started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("event channel closed");
                        break;
                    };
                    apply(&self.cache, &event);
                }
            }
        }
        info!("event dispatcher stopped");
    }
}
