//! Domain event snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a persisted event
pub type EventId = i64;

/// Where an event originated
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventContext {
    /// Component that raised the event (e.g. "core", "mod_forum")
    pub component: Option<String>,

    /// Context the event happened in
    pub context_id: Option<i64>,

    /// User who caused the event
    pub user_id: Option<i64>,

    /// User affected by the event
    pub related_user_id: Option<i64>,

    /// Origin of the request (e.g. "web", "cli", "ws")
    pub origin: Option<String>,
}

/// An event as supplied by the event source, before it is persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub name: String,
    pub context: EventContext,
    pub fields: Map<String, Value>,
    pub time_created: DateTime<Utc>,

    /// Optional key making repeated submissions of the same occurrence idempotent
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(name: impl Into<String>, time_created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            context: EventContext::default(),
            fields: Map::new(),
            time_created,
            idempotency_key: None,
        }
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Materialize the persisted snapshot once the store has assigned an id
    pub fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            name: self.name,
            context: self.context,
            fields: self.fields,
            time_created: self.time_created,
        }
    }
}

/// Immutable snapshot of a domain occurrence
///
/// Created once per occurrence and never mutated. Run records embed a copy
/// so history stays replayable after retention removes the original row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub context: EventContext,
    pub fields: Map<String, Value>,
    pub time_created: DateTime<Utc>,
}

impl Event {
    /// Resolve a field by name
    ///
    /// Standard attributes (`eventid`, `eventname`, `component`, `contextid`,
    /// `userid`, `relateduserid`, `origin`, `timecreated`) take precedence over
    /// the raw field map. Returns `None` for unknown names and unset attributes.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "eventid" => Some(Value::from(self.id)),
            "eventname" => Some(Value::from(self.name.clone())),
            "component" => self.context.component.clone().map(Value::from),
            "contextid" => self.context.context_id.map(Value::from),
            "userid" => self.context.user_id.map(Value::from),
            "relateduserid" => self.context.related_user_id.map(Value::from),
            "origin" => self.context.origin.clone().map(Value::from),
            "timecreated" => Some(Value::from(self.time_created.timestamp())),
            _ => self.fields.get(name).cloned(),
        }
    }
}
