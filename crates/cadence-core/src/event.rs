//! Event documents: the only persistent entity the engine works on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::EventFault;

/// Opaque event identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an event document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    /// Recurring template. Never dispatched, only rescheduled.
    Scheduled,
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl EventState {
    pub const POLLABLE: [EventState; 2] = [EventState::Pending, EventState::Scheduled];

    pub fn is_pollable(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Script,
    Driver,
    Console,
    Notification,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Driver => "driver",
            Self::Console => "console",
            Self::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "script" => Some(Self::Script),
            "driver" => Some(Self::Driver),
            "console" => Some(Self::Console),
            "notification" => Some(Self::Notification),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventPayload {
    /// Fires runtime listeners registered for `event`.
    Script {
        event: String,
        #[serde(default)]
        param: Value,
    },
    /// Runs an object operation. `options` names `object` and `operation`.
    Driver {
        #[serde(default)]
        options: Value,
        #[serde(default)]
        privileged: bool,
    },
    Console {
        #[serde(default)]
        param: Value,
    },
    Notification {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        variables: Value,
        #[serde(default)]
        options: Value,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Script { .. } => EventType::Script,
            Self::Driver { .. } => EventType::Driver,
            Self::Console { .. } => EventType::Console,
            Self::Notification { .. } => EventType::Notification,
        }
    }
}

/// Which terminal outcomes are persisted rather than reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Retention(u8);

impl Retention {
    pub const NEVER: Retention = Retention(0);
    pub const FAILED: Retention = Retention(1);
    pub const COMPLETED: Retention = Retention(2);
    pub const SKIPPED: Retention = Retention(4);
    pub const ALL: Retention = Retention(7);

    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits <= Self::ALL.0).then_some(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Retention) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Retention {
    type Output = Retention;

    fn bitor(self, rhs: Self) -> Self {
        Retention(self.0 | rhs.0)
    }
}

/// A full event document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub tenant: String,
    /// Optional dedup key. Unset whenever the document is reaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub state: EventState,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub sequence: u64,
    pub shard_key: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default)]
    pub retention: Retention,
    /// Conditional guard, evaluated with the document as root context.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Value>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default)]
    pub reap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<EventFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    pub created: DateTime<Utc>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Poll-time projection of this document.
    pub fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id.clone(),
            tenant: self.tenant.clone(),
            event_type: self.event_type(),
            state: self.state,
            start: self.start,
            schedule: self.schedule.clone(),
            started: self.started,
            count: self.count,
            sequence: self.sequence,
            expires_at: self.expires_at,
        }
    }

    /// Read-only JSON view handed to scripts and hooks.
    pub fn read_view(&self) -> Value {
        let mut view = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut view {
            map.remove("shardKey");
            map.remove("sequence");
            map.remove("reap");
            map.insert("object".into(), Value::String("event".into()));
        }
        view
    }
}

/// The subset of an event loaded by the poll cursor, enough to classify it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: EventId,
    pub tenant: String,
    pub event_type: EventType,
    pub state: EventState,
    pub start: DateTime<Utc>,
    pub schedule: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub count: u64,
    pub sequence: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
