//! Poll cursor: one bounded, sharded read of due events.

use cadence_core::config::ReadPreference;
use cadence_core::event::{Candidate, EventState};
use chrono::{DateTime, Utc};

use crate::shard::ShardRange;
use crate::store::{CandidateQuery, EventStore};

#[derive(Debug, Clone)]
pub struct PollCursor {
    range: ShardRange,
    read_preference: ReadPreference,
}

impl PollCursor {
    pub fn new(range: ShardRange, read_preference: ReadPreference) -> Self {
        Self {
            range,
            read_preference,
        }
    }

    pub fn range(&self) -> ShardRange {
        self.range
    }

    pub fn query(&self, now: DateTime<Utc>, limit: usize) -> CandidateQuery {
        CandidateQuery {
            shard_lower: self.range.lower,
            shard_upper: self.range.upper,
            states: EventState::POLLABLE.to_vec(),
            now,
            limit,
            read_preference: self.read_preference,
        }
    }

    /// Due candidates in `start` order. A failed read yields nothing; the
    /// loop simply backs off and tries again.
    pub async fn poll(&self, store: &dyn EventStore, now: DateTime<Utc>, limit: usize) -> Vec<Candidate> {
        if limit == 0 {
            return Vec::new();
        }
        match store.find_candidates(&self.query(now, limit)).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("❌ Event poll failed: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use cadence_core::event::{Event, EventId, EventPayload, Retention};
    use chrono::Duration;
    use serde_json::json;

    fn event(id: &str, shard_key: u32, start: DateTime<Utc>, state: EventState) -> Event {
        Event {
            id: EventId::from(id),
            tenant: "acme".into(),
            key: None,
            state,
            start,
            schedule: None,
            started: None,
            count: 0,
            sequence: 0,
            shard_key,
            expires_at: None,
            principal: None,
            retention: Retention::NEVER,
            guard: None,
            payload: EventPayload::Console { param: json!(id) },
            reap: false,
            err: None,
            parent: None,
            parent_key: None,
            created: start,
        }
    }

    #[tokio::test]
    async fn test_poll_filters_and_orders() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        store.insert(&event("late", 5, now - Duration::seconds(1), EventState::Pending)).await.unwrap();
        store.insert(&event("early", 6, now - Duration::seconds(9), EventState::Pending)).await.unwrap();
        store.insert(&event("future", 5, now + Duration::seconds(30), EventState::Pending)).await.unwrap();
        store.insert(&event("foreign", 500, now - Duration::seconds(5), EventState::Pending)).await.unwrap();
        store.insert(&event("busy", 7, now - Duration::seconds(5), EventState::Processing)).await.unwrap();

        let cursor = PollCursor::new(ShardRange { lower: 0, upper: 100 }, ReadPreference::Primary);
        let ids: Vec<String> = cursor
            .poll(&store, now, 10)
            .await
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["early", "late"]);

        assert_eq!(cursor.poll(&store, now, 1).await.len(), 1);
        assert!(cursor.poll(&store, now, 0).await.is_empty());
    }
}
