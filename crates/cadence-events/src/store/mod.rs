//! Event store contract.
//!
//! The store is the only shared mutable resource. Every mutation goes through
//! [`EventStore::find_one_and_update`], an atomic conditional update that is a
//! silent no-op when its match predicate no longer holds.

use async_trait::async_trait;
use cadence_core::config::ReadPreference;
use cadence_core::error::{EventFault, Result};
use cadence_core::event::{Candidate, Event, EventId, EventState};
use chrono::{DateTime, Utc};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

/// The bounded, sharded poll query.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub shard_lower: u32,
    pub shard_upper: u32,
    pub states: Vec<EventState>,
    /// Only documents with `start <= now` are eligible.
    pub now: DateTime<Utc>,
    pub limit: usize,
    pub read_preference: ReadPreference,
}

impl CandidateQuery {
    pub fn matches(&self, event: &Event) -> bool {
        !event.reap
            && event.shard_key >= self.shard_lower
            && event.shard_key <= self.shard_upper
            && self.states.contains(&event.state)
            && event.start <= self.now
    }
}

/// Predicate of a conditional update. `reap = false` is always implied.
#[derive(Debug, Clone, Default)]
pub struct ClaimMatch {
    pub id: Option<EventId>,
    pub state: Option<EventState>,
    pub start: Option<DateTime<Utc>>,
    pub sequence: Option<u64>,
    pub count: Option<u64>,
    /// `Some(None)` matches documents without an expiry.
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl ClaimMatch {
    pub fn id(id: &EventId) -> Self {
        Self {
            id: Some(id.clone()),
            ..Default::default()
        }
    }

    pub fn state(mut self, state: EventState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        !event.reap
            && self.id.as_ref().is_none_or(|id| *id == event.id)
            && self.state.is_none_or(|s| s == event.state)
            && self.start.is_none_or(|s| s == event.start)
            && self.sequence.is_none_or(|s| s == event.sequence)
            && self.count.is_none_or(|c| c == event.count)
            && self.expires_at.is_none_or(|e| e == event.expires_at)
    }
}

/// Mutation applied when a [`ClaimMatch`] holds.
#[derive(Debug, Clone, Default)]
pub struct ClaimUpdate {
    pub state: Option<EventState>,
    pub start: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub err: Option<EventFault>,
    pub inc_count: bool,
    pub inc_sequence: bool,
    pub reap: bool,
    pub unset_key: bool,
}

impl ClaimUpdate {
    pub fn apply(&self, event: &mut Event) {
        if let Some(state) = self.state {
            event.state = state;
        }
        if let Some(start) = self.start {
            event.start = start;
        }
        if let Some(started) = self.started {
            event.started = Some(started);
        }
        if let Some(err) = &self.err {
            event.err = Some(err.sanitized());
        }
        if self.inc_count {
            event.count += 1;
        }
        if self.inc_sequence {
            event.sequence += 1;
        }
        if self.reap {
            event.reap = true;
        }
        if self.unset_key {
            event.key = None;
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Eligible candidates, ascending by `start`, at most `query.limit`.
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>>;

    /// Atomically apply `update` to the single document matching `filter`.
    /// Returns the document after the update, or `None` when nothing matched.
    async fn find_one_and_update(
        &self,
        filter: &ClaimMatch,
        update: &ClaimUpdate,
    ) -> Result<Option<Event>>;

    async fn insert(&self, event: &Event) -> Result<()>;

    async fn get(&self, id: &EventId) -> Result<Option<Event>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::event::{EventPayload, Retention};
    use serde_json::json;

    fn event() -> Event {
        let now = Utc::now();
        Event {
            id: EventId::from("e1"),
            tenant: "acme".into(),
            key: Some("k".into()),
            state: EventState::Pending,
            start: now,
            schedule: None,
            started: None,
            count: 3,
            sequence: 7,
            shard_key: 10,
            expires_at: None,
            principal: None,
            retention: Retention::NEVER,
            guard: None,
            payload: EventPayload::Console { param: json!(1) },
            reap: false,
            err: None,
            parent: None,
            parent_key: None,
            created: now,
        }
    }

    #[test]
    fn test_match_on_stale_sequence_fails() {
        let e = event();
        assert!(ClaimMatch::id(&e.id).sequence(7).state(EventState::Pending).matches(&e));
        assert!(!ClaimMatch::id(&e.id).sequence(6).matches(&e));
        assert!(!ClaimMatch::id(&e.id).state(EventState::Processing).matches(&e));
        assert!(ClaimMatch::id(&e.id).expires_at(None).matches(&e));
    }

    #[test]
    fn test_reaped_never_matches() {
        let mut e = event();
        e.reap = true;
        assert!(!ClaimMatch::id(&e.id).matches(&e));
    }

    #[test]
    fn test_update_reap_unsets_key() {
        let mut e = event();
        ClaimUpdate {
            reap: true,
            unset_key: true,
            ..Default::default()
        }
        .apply(&mut e);
        assert!(e.reap);
        assert!(e.key.is_none());
        assert_eq!(e.sequence, 7);
    }

    #[test]
    fn test_update_strips_fault_stack() {
        let mut e = event();
        ClaimUpdate {
            state: Some(EventState::Failed),
            err: Some(EventFault::new("x", "y").with_stack("trace")),
            ..Default::default()
        }
        .apply(&mut e);
        assert_eq!(e.state, EventState::Failed);
        assert!(e.err.unwrap().stack.is_none());
    }
}
