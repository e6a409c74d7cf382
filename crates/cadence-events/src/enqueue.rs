//! Enqueue helpers: build well-formed event documents and insert them.

use cadence_core::error::{CadenceError, Result};
use cadence_core::event::{Event, EventId, EventPayload, EventState, Retention};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cron;
use crate::shard::generate_shard_key;
use crate::store::EventStore;

const MAX_SCRIPT_EVENT_LEN: usize = 128;

/// Builder for a new one-shot or recurring event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    tenant: String,
    payload: EventPayload,
    schedule: Option<String>,
    start: Option<DateTime<Utc>>,
    key: Option<String>,
    principal: Option<String>,
    retention: Retention,
    guard: Option<Value>,
    expires_at: Option<DateTime<Utc>>,
    max_shard_key: u32,
}

impl NewEvent {
    pub fn new(tenant: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            tenant: tenant.into(),
            payload,
            schedule: None,
            start: None,
            key: None,
            principal: None,
            retention: Retention::NEVER,
            guard: None,
            expires_at: None,
            max_shard_key: u32::MAX,
        }
    }

    /// Make this a recurring template on a 5-field cron schedule.
    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Delay a one-shot event. Ignored for recurring templates.
    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn guard(mut self, guard: Value) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn max_shard_key(mut self, max: u32) -> Self {
        self.max_shard_key = max;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(CadenceError::InvalidEvent("tenant is required".into()));
        }
        if Retention::from_bits(self.retention.bits()).is_none() {
            return Err(CadenceError::InvalidEvent(format!(
                "retention {} out of range 0..=7",
                self.retention.bits()
            )));
        }
        match &self.payload {
            EventPayload::Script { event, .. } => {
                if event.is_empty() || event.chars().count() > MAX_SCRIPT_EVENT_LEN {
                    return Err(CadenceError::InvalidEvent(format!(
                        "script event name must be 1 to {MAX_SCRIPT_EVENT_LEN} characters"
                    )));
                }
            }
            EventPayload::Driver { options, .. } if !options.is_object() => {
                return Err(CadenceError::InvalidEvent("driver options must be an object".into()));
            }
            _ => {}
        }
        Ok(())
    }

    /// The document to insert.
    pub fn build(self, now: DateTime<Utc>) -> Result<Event> {
        self.validate()?;

        let (state, start) = match &self.schedule {
            Some(schedule) => {
                let first = cron::validate_schedule(schedule)?
                    .next_after(now)
                    .ok_or_else(|| CadenceError::Cron(format!("'{schedule}' never fires")))?;
                (EventState::Scheduled, first)
            }
            None => (EventState::Pending, self.start.unwrap_or(now)),
        };

        Ok(Event {
            id: EventId::generate(),
            tenant: self.tenant,
            key: self.key,
            state,
            start,
            schedule: self.schedule,
            started: None,
            count: 0,
            sequence: 0,
            shard_key: generate_shard_key(self.max_shard_key),
            expires_at: self.expires_at,
            principal: self.principal,
            retention: self.retention,
            guard: self.guard,
            payload: self.payload,
            reap: false,
            err: None,
            parent: None,
            parent_key: None,
            created: now,
        })
    }
}

/// Build and insert `new`, returning the stored document.
pub async fn enqueue(store: &dyn EventStore, new: NewEvent, now: DateTime<Utc>) -> Result<Event> {
    let event = new.build(now)?;
    store.insert(&event).await?;
    tracing::debug!(
        "📥 Enqueued {} event {} for tenant {} ({})",
        event.event_type(),
        event.id,
        event.tenant,
        event.state
    );
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn script(name: &str) -> EventPayload {
        EventPayload::Script {
            event: name.into(),
            param: json!(null),
        }
    }

    #[test]
    fn test_one_shot_defaults() {
        let now = Utc::now();
        let event = NewEvent::new("acme", script("c_hello")).build(now).unwrap();
        assert_eq!(event.state, EventState::Pending);
        assert_eq!(event.start, now);
        assert_eq!(event.sequence, 0);
        assert_eq!(event.count, 0);
        assert_eq!(event.retention, Retention::NEVER);
        assert!(!event.reap);
    }

    #[test]
    fn test_recurring_starts_at_next_fire() {
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 10, 15, 0).unwrap();
        let event = NewEvent::new("acme", script("c_tick"))
            .schedule("0 * * * *")
            .start(now - Duration::days(1))
            .build(now)
            .unwrap();
        assert_eq!(event.state, EventState::Scheduled);
        assert_eq!(event.start, Utc.with_ymd_and_hms(2026, 4, 2, 11, 0, 0).unwrap());
        assert_eq!(event.schedule.as_deref(), Some("0 * * * *"));
    }

    #[test]
    fn test_rejects_invalid_events() {
        let now = Utc::now();
        assert!(NewEvent::new("acme", script("")).build(now).is_err());
        assert!(NewEvent::new("acme", script(&"x".repeat(129))).build(now).is_err());
        assert!(NewEvent::new("", script("c_ok")).build(now).is_err());
        assert!(NewEvent::new("acme", script("c_ok")).schedule("* * * * * *").build(now).is_err());
        assert!(
            NewEvent::new(
                "acme",
                EventPayload::Driver {
                    options: json!("nope"),
                    privileged: false
                }
            )
            .build(now)
            .is_err()
        );
    }

    #[test]
    fn test_shard_key_bounded() {
        let event = NewEvent::new("acme", script("c_ok"))
            .max_shard_key(15)
            .build(Utc::now())
            .unwrap();
        assert!(event.shard_key <= 15);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_key() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let first = enqueue(&store, NewEvent::new("acme", script("c_ok")).key("once"), now)
            .await
            .unwrap();
        assert_eq!(store.get(&first.id).await.unwrap().unwrap(), first);
        assert!(enqueue(&store, NewEvent::new("acme", script("c_ok")).key("once"), now).await.is_err());
    }
}
