//! Claim protocol: optimistic, versioned ownership transfer.
//!
//! Every claim re-states what the poll cursor observed. If another worker got
//! there first the predicate no longer matches, the store does nothing, and
//! this worker abandons the candidate.

use cadence_core::error::Result;
use cadence_core::event::{Candidate, Event, EventState};
use chrono::{DateTime, Duration, Utc};

use crate::store::{ClaimMatch, ClaimUpdate, EventStore};

/// Result of a process claim.
#[derive(Debug)]
pub enum ProcessClaim {
    /// This worker now owns the event in `processing`.
    Claimed(Event),
    /// Tenant script capacity is saturated; `start` was pushed back.
    Deferred(Event),
    /// Someone else changed the document first.
    Lost,
}

/// Reap an event whose `expiresAt` passed before it was processed.
pub async fn expire_claim(store: &dyn EventStore, candidate: &Candidate) -> Result<bool> {
    let filter = ClaimMatch::id(&candidate.id).expires_at(candidate.expires_at);
    let update = ClaimUpdate {
        reap: true,
        unset_key: true,
        ..Default::default()
    };
    Ok(store.find_one_and_update(&filter, &update).await?.is_some())
}

/// Advance a recurring template to its next fire time.
pub async fn schedule_claim(
    store: &dyn EventStore,
    candidate: &Candidate,
    next_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<Event>> {
    let filter = ClaimMatch::id(&candidate.id)
        .count(candidate.count)
        .sequence(candidate.sequence);
    let update = ClaimUpdate {
        start: Some(next_start),
        started: Some(now),
        inc_count: true,
        inc_sequence: true,
        ..Default::default()
    };
    store.find_one_and_update(&filter, &update).await
}

/// Move a one-shot event to `processing`, or defer it under script backpressure.
pub async fn process_claim(
    store: &dyn EventStore,
    candidate: &Candidate,
    now: DateTime<Utc>,
    can_run: bool,
    defer_by: Duration,
) -> Result<ProcessClaim> {
    let filter = ClaimMatch::id(&candidate.id)
        .state(candidate.state)
        .start(candidate.start)
        .sequence(candidate.sequence);
    let update = if can_run {
        ClaimUpdate {
            state: Some(EventState::Processing),
            started: Some(now),
            inc_sequence: true,
            ..Default::default()
        }
    } else {
        ClaimUpdate {
            start: Some(now + defer_by),
            inc_sequence: true,
            ..Default::default()
        }
    };

    Ok(match store.find_one_and_update(&filter, &update).await? {
        Some(event) if can_run => ProcessClaim::Claimed(event),
        Some(event) => ProcessClaim::Deferred(event),
        None => ProcessClaim::Lost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use cadence_core::event::{EventId, EventPayload, Retention};
    use serde_json::json;

    fn pending(id: &str, now: DateTime<Utc>) -> Event {
        Event {
            id: EventId::from(id),
            tenant: "acme".into(),
            key: Some(format!("key-{id}")),
            state: EventState::Pending,
            start: now - Duration::seconds(1),
            schedule: None,
            started: None,
            count: 0,
            sequence: 0,
            shard_key: 1,
            expires_at: None,
            principal: None,
            retention: Retention::NEVER,
            guard: None,
            payload: EventPayload::Script {
                event: "c_ping".into(),
                param: json!(null),
            },
            reap: false,
            err: None,
            parent: None,
            parent_key: None,
            created: now,
        }
    }

    #[tokio::test]
    async fn test_only_one_process_claim_wins() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let event = pending("a", now);
        store.insert(&event).await.unwrap();
        let candidate = event.candidate();

        let first = process_claim(&store, &candidate, now, true, Duration::zero()).await.unwrap();
        let second = process_claim(&store, &candidate, now, true, Duration::zero()).await.unwrap();

        match first {
            ProcessClaim::Claimed(e) => {
                assert_eq!(e.state, EventState::Processing);
                assert_eq!(e.sequence, 1);
                assert_eq!(e.started, Some(now));
            }
            other => panic!("expected claim, got {other:?}"),
        }
        assert!(matches!(second, ProcessClaim::Lost));
    }

    #[tokio::test]
    async fn test_saturated_tenant_defers_without_claiming() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let event = pending("a", now);
        store.insert(&event).await.unwrap();

        let result = process_claim(
            &store,
            &event.candidate(),
            now,
            false,
            Duration::milliseconds(500),
        )
        .await
        .unwrap();
        match result {
            ProcessClaim::Deferred(e) => {
                assert_eq!(e.state, EventState::Pending);
                assert_eq!(e.start, now + Duration::milliseconds(500));
                assert_eq!(e.sequence, 1);
            }
            other => panic!("expected deferral, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expire_claim_reaps_and_unsets_key() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let mut event = pending("a", now);
        event.expires_at = Some(now - Duration::seconds(5));
        store.insert(&event).await.unwrap();

        assert!(expire_claim(&store, &event.candidate()).await.unwrap());
        let stored = store.get(&event.id).await.unwrap().unwrap();
        assert!(stored.reap);
        assert!(stored.key.is_none());
        assert_eq!(stored.state, EventState::Pending);

        // Already reaped: a second expire is a no-op.
        assert!(!expire_claim(&store, &event.candidate()).await.unwrap());
    }

    #[tokio::test]
    async fn test_schedule_claim_checks_count_and_sequence() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let mut template = pending("t", now);
        template.state = EventState::Scheduled;
        template.schedule = Some("0 * * * *".into());
        template.count = 4;
        template.sequence = 9;
        store.insert(&template).await.unwrap();
        let candidate = template.candidate();
        let next = now + Duration::hours(1);

        let updated = schedule_claim(&store, &candidate, next, now).await.unwrap().unwrap();
        assert_eq!(updated.count, 5);
        assert_eq!(updated.sequence, 10);
        assert_eq!(updated.start, next);
        assert_eq!(updated.state, EventState::Scheduled);

        assert!(schedule_claim(&store, &candidate, next, now).await.unwrap().is_none());
    }
}
