//! Rescheduler: turns a due recurring template into its next fire time plus
//! one freshly spawned one-shot instance.

use cadence_core::error::{CadenceError, Result};
use cadence_core::event::{Candidate, Event, EventId, EventState};
use chrono::{DateTime, Duration, Utc};

use crate::claim;
use crate::cron;
use crate::store::EventStore;

const EVERY_SECOND: &str = "* * * * * *";
const EVERY_MINUTE: &str = "* * * * *";

/// Next `start` for a template, never sooner than one second from `now`.
pub fn next_start(schedule: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule.trim() {
        EVERY_SECOND => return Ok(now + Duration::seconds(1)),
        EVERY_MINUTE => return Ok(now + Duration::seconds(60)),
        _ => {}
    }

    let floor = now + Duration::seconds(1);
    let upcoming = cron::next_fire_times(schedule, now, 2)?;
    if upcoming.is_empty() {
        return Err(CadenceError::Cron(format!("'{schedule}' has no upcoming fire times")));
    }
    Ok(upcoming
        .into_iter()
        .find(|t| *t >= floor)
        .unwrap_or(floor))
}

/// A one-shot instance of `template`, due immediately.
///
/// The instance keeps the template's shard key so it stays inside the
/// cluster's key space and lands on the same owner.
pub fn spawn_instance(template: &Event, now: DateTime<Utc>) -> Event {
    Event {
        id: EventId::generate(),
        tenant: template.tenant.clone(),
        key: None,
        state: EventState::Pending,
        start: now,
        schedule: None,
        started: None,
        count: 0,
        sequence: 0,
        shard_key: template.shard_key,
        expires_at: None,
        principal: template.principal.clone(),
        retention: template.retention,
        guard: None,
        payload: template.payload.clone(),
        reap: false,
        err: None,
        parent: Some(template.id.clone()),
        parent_key: template.key.clone(),
        created: now,
    }
}

/// Schedule-claims a template and inserts the spawned instance.
///
/// Returns the spawned instance, or `None` when the template could not be
/// advanced (claim lost, or its schedule is unusable). A broken schedule is
/// logged and the template is left untouched.
pub async fn reschedule(
    store: &dyn EventStore,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> Result<Option<Event>> {
    let Some(schedule) = candidate.schedule.as_deref() else {
        tracing::warn!("⚠️ Scheduled event {} has no schedule, leaving it as is", candidate.id);
        return Ok(None);
    };

    let start = match next_start(schedule, now) {
        Ok(start) => start,
        Err(e) => {
            tracing::warn!(
                "⚠️ Cannot compute next run for event {} ({}): {e}",
                candidate.id,
                schedule
            );
            return Ok(None);
        }
    };

    let Some(template) = claim::schedule_claim(store, candidate, start, now).await? else {
        tracing::debug!("Schedule claim for {} lost to another worker", candidate.id);
        return Ok(None);
    };

    let instance = spawn_instance(&template, now);
    store.insert(&instance).await?;
    tracing::debug!(
        "🔁 Event {} fired (#{}) → instance {}, next at {}",
        template.id,
        template.count,
        instance.id,
        start
    );
    Ok(Some(instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use cadence_core::event::{EventPayload, Retention};
    use chrono::{TimeZone, Timelike};
    use serde_json::json;

    fn template(now: DateTime<Utc>, schedule: &str) -> Event {
        Event {
            id: EventId::from("tpl"),
            tenant: "acme".into(),
            key: Some("hourly-sync".into()),
            state: EventState::Scheduled,
            start: now - Duration::seconds(1),
            schedule: Some(schedule.into()),
            started: None,
            count: 0,
            sequence: 0,
            shard_key: 5,
            expires_at: None,
            principal: Some("user-1".into()),
            retention: Retention::FAILED,
            guard: None,
            payload: EventPayload::Notification {
                name: Some("digest".into()),
                variables: json!({"n": 1}),
                options: json!({"channel": "email"}),
            },
            reap: false,
            err: None,
            parent: None,
            parent_key: None,
            created: now,
        }
    }

    #[test]
    fn test_shortcuts_bypass_evaluator() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
            + Duration::milliseconds(250);
        assert_eq!(next_start("* * * * * *", now).unwrap(), now + Duration::seconds(1));
        assert_eq!(next_start("* * * * *", now).unwrap(), now + Duration::seconds(60));
    }

    #[test]
    fn test_first_candidate_beyond_floor() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 10, 30, 0).unwrap();
        let next = next_start("0 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_floor_skips_to_second_candidate() {
        // The first */2-second fire lands 0.5s out, inside the floor.
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 1).unwrap()
            + Duration::milliseconds(500);
        let next = next_start("*/2 * * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 4).unwrap());
        assert!(next >= now + Duration::seconds(1));
    }

    #[test]
    fn test_every_second_without_shortcut() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
            + Duration::milliseconds(100);
        let next = next_start("0-59 * * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 2).unwrap());
        assert_eq!(next.second(), 2);
    }

    #[test]
    fn test_invalid_schedule_errors() {
        let now = Utc::now();
        assert!(next_start("nonsense", now).is_err());
        assert!(next_start("0 0 30 2 *", now).is_err());
    }

    #[test]
    fn test_spawned_instance_copies_payload() {
        let now = Utc::now();
        let tpl = template(now, "0 * * * *");
        let instance = spawn_instance(&tpl, now);
        assert_ne!(instance.id, tpl.id);
        assert_eq!(instance.state, EventState::Pending);
        assert_eq!(instance.sequence, 0);
        assert_eq!(instance.parent.as_ref(), Some(&tpl.id));
        assert_eq!(instance.parent_key.as_deref(), Some("hourly-sync"));
        assert_eq!(instance.retention, Retention::FAILED);
        assert_eq!(instance.principal.as_deref(), Some("user-1"));
        assert_eq!(instance.payload, tpl.payload);
        assert!(instance.schedule.is_none());
        assert!(instance.key.is_none());
        assert_eq!(instance.shard_key, tpl.shard_key);
    }

    #[tokio::test]
    async fn test_spawned_instance_stays_in_cluster_key_space() {
        use crate::shard::ShardMap;

        let map = ShardMap::new(1, 99);
        let range = map.ranges()[0];
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let tpl = template(now, "* * * * *");
        store.insert(&tpl).await.unwrap();

        let spawned = reschedule(&store, &tpl.candidate(), now).await.unwrap().unwrap();
        assert!(range.contains(spawned.shard_key));
        assert_eq!(map.index_of(spawned.shard_key), Some(0));
    }

    #[tokio::test]
    async fn test_reschedule_advances_template_and_spawns() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let tpl = template(now, "0 * * * *");
        store.insert(&tpl).await.unwrap();

        let spawned = reschedule(&store, &tpl.candidate(), now).await.unwrap().unwrap();
        let updated = store.get(&tpl.id).await.unwrap().unwrap();
        assert_eq!(updated.state, EventState::Scheduled);
        assert_eq!(updated.count, 1);
        assert_eq!(updated.sequence, 1);
        assert!(updated.start > now);
        assert_eq!(updated.started, Some(now));
        assert_eq!(store.len(), 2);
        assert_eq!(spawned.parent.as_ref(), Some(&tpl.id));
    }

    #[tokio::test]
    async fn test_broken_schedule_leaves_template_untouched() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let tpl = template(now, "not a cron");
        store.insert(&tpl).await.unwrap();

        assert!(reschedule(&store, &tpl.candidate(), now).await.unwrap().is_none());
        let stored = store.get(&tpl.id).await.unwrap().unwrap();
        assert_eq!(stored, tpl);
        assert_eq!(store.len(), 1);
    }
}
