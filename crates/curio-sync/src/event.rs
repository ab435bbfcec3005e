//! Server-push events.
//!
//! Every push message carries a JSON object `{"type": "...", "payload": {...}}`.
//! Event types follow `<entity>.<action>` (e.g. `job.progress`), plus the
//! transport-only `heartbeat`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Event type that only keeps the transport alive.
pub const HEARTBEAT: &str = "heartbeat";

/// Entity families that emit push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Background processing jobs (`job.*`).
    Job,
    /// Catalog items (`item.*`).
    Item,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Item => "item",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "job" => Some(Self::Job),
            "item" => Some(Self::Item),
            _ => None,
        }
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Created,
    Status,
    Progress,
    Completed,
    Failed,
    Cancelled,
    Deleted,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "status" => Self::Status,
            "progress" => Self::Progress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "deleted" => Self::Deleted,
            _ => return None,
        })
    }
}

/// Classified event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Entity {
        entity: EntityKind,
        action: EventAction,
    },
    Heartbeat,
    /// Anything outside the known vocabulary.
    Unknown,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        if event_type == HEARTBEAT {
            return Self::Heartbeat;
        }
        let Some((entity, action)) = event_type.split_once('.') else {
            return Self::Unknown;
        };
        match (EntityKind::parse(entity), EventAction::parse(action)) {
            (Some(entity), Some(action)) => Self::Entity { entity, action },
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity { entity, action } => write!(f, "{}.{}", entity.as_str(), action.as_str()),
            Self::Heartbeat => f.write_str(HEARTBEAT),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Option<Value>,
}

/// A parsed push message. Consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_type: String,
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Parse a raw message body.
    ///
    /// A missing or `null` payload is treated as empty; any other non-object
    /// payload is malformed.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let wire: WireEvent =
            serde_json::from_str(text).map_err(|e| SyncError::MalformedEvent(e.to_string()))?;
        let payload = match wire.payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(SyncError::MalformedEvent(format!(
                    "payload of {} is not an object: {}",
                    wire.event_type, other
                )));
            }
        };
        Ok(Self::new(wire.event_type, payload))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// The `id` of the affected entity.
    pub fn entity_id(&self) -> Option<&Value> {
        self.payload.get("id").filter(|id| id.is_string() || id.is_number())
    }

    /// Payload fields other than `id`.
    pub fn patch_fields(&self) -> Map<String, Value> {
        self.payload
            .iter()
            .filter(|(name, _)| name.as_str() != "id")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}
