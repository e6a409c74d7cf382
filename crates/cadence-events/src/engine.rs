//! Event engine run loop.
//!
//! One loop per engine instance polls its shard range, routes each candidate
//! to expiry, rescheduling or dispatch, and backs off when there is nothing
//! to do. Dispatches run as spawned tasks, at most `max_concurrent_messages`
//! at a time.

use cadence_core::clock::Clock;
use cadence_core::config::EventsConfig;
use cadence_core::event::{Candidate, Event, EventId, EventState, EventType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::claim::{self, ProcessClaim};
use crate::command::PollHandle;
use crate::completion;
use crate::cursor::PollCursor;
use crate::dispatch::{Dispatcher, Outcome};
use crate::reschedule;
use crate::shard::ShardRange;
use crate::store::EventStore;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of an engine's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub poll_in_ms: u64,
    pub cur_poll_ms: u64,
    pub last_event: Option<EventId>,
    pub in_flight: usize,
    pub num_processed: u64,
    pub num_loops: u64,
    pub last_processed: Option<DateTime<Utc>>,
}

struct Inner {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    config: EventsConfig,
    cursor: PollCursor,
    backoff: Arc<Mutex<Backoff>>,
    wake: Arc<Notify>,
    in_flight: Mutex<HashSet<EventId>>,
    drained: Notify,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    num_processed: AtomicU64,
    num_loops: AtomicU64,
    last_event: Mutex<Option<EventId>>,
    last_processed: Mutex<Option<DateTime<Utc>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Polling and dispatch engine for one shard range.
#[derive(Clone)]
pub struct EventEngine {
    inner: Arc<Inner>,
}

impl EventEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Dispatcher,
        config: EventsConfig,
        range: ShardRange,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cursor: PollCursor::new(range, config.read_preference),
                backoff: Arc::new(Mutex::new(Backoff::from_config(&config))),
                store,
                dispatcher,
                clock,
                config,
                wake: Arc::new(Notify::new()),
                in_flight: Mutex::new(HashSet::new()),
                drained: Notify::new(),
                shutdown,
                running: AtomicBool::new(false),
                num_processed: AtomicU64::new(0),
                num_loops: AtomicU64::new(0),
                last_event: Mutex::new(None),
                last_processed: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn shard_range(&self) -> ShardRange {
        self.inner.cursor.range()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Handle for "poll now" commands addressed to this engine.
    pub fn poll_handle(&self) -> PollHandle {
        PollHandle::new(self.inner.backoff.clone(), self.inner.wake.clone())
    }

    /// Spawn the run loop. No-op when already running.
    pub fn start(&self) {
        let mut task = locked(&self.inner.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.shutdown.send_replace(false);
        let engine = self.clone();
        *task = Some(tokio::spawn(async move { engine.run().await }));
    }

    /// Signal the loop to stop and wait for in-flight dispatches to drain.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let task = locked(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("❌ Event engine task failed: {e}");
            }
        }
    }

    /// Run until stopped, then drain.
    pub async fn run(&self) {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        inner.running.store(true, Ordering::SeqCst);
        let range = inner.cursor.range();
        tracing::info!(
            "⏰ Event engine started (shards {}..={}, max {} in flight)",
            range.lower,
            range.upper,
            inner.config.max_concurrent_messages
        );

        loop {
            let stopping = *shutdown.borrow_and_update();
            if stopping {
                break;
            }
            let found = self.run_once().await;
            {
                let mut backoff = locked(&inner.backoff);
                if found > 0 {
                    backoff.reset();
                }
                backoff.next_interval();
            }
            self.wait(&mut shutdown).await;
        }

        self.drain().await;
        inner.running.store(false, Ordering::SeqCst);
        tracing::info!("🛑 Event engine stopped");
    }

    /// Poll once and route every candidate. Returns how many were found.
    pub async fn run_once(&self) -> usize {
        let inner = &self.inner;
        inner.num_loops.fetch_add(1, Ordering::Relaxed);

        let capacity = inner
            .config
            .max_concurrent_messages
            .saturating_sub(locked(&inner.in_flight).len());
        if capacity == 0 {
            return 0;
        }

        let now = inner.clock.now();
        let candidates = inner.cursor.poll(inner.store.as_ref(), now, capacity).await;
        for candidate in &candidates {
            self.route(candidate, now).await;
        }
        candidates.len()
    }

    async fn route(&self, candidate: &Candidate, now: DateTime<Utc>) {
        let inner = &self.inner;
        let store = inner.store.as_ref();
        *locked(&inner.last_event) = Some(candidate.id.clone());

        if candidate.is_expired(now) {
            match claim::expire_claim(store, candidate).await {
                Ok(true) => tracing::debug!("⌛ Event {} expired", candidate.id),
                Ok(false) => {}
                Err(e) => tracing::error!("❌ Expire claim for {} failed: {e}", candidate.id),
            }
            return;
        }

        if candidate.state == EventState::Scheduled {
            if let Err(e) = reschedule::reschedule(store, candidate, now).await {
                tracing::error!("❌ Reschedule of {} failed: {e}", candidate.id);
            }
            return;
        }

        let can_run = candidate.event_type != EventType::Script
            || inner.dispatcher.can_run_script(&candidate.tenant);
        let defer_by = chrono::Duration::from_std(inner.config.script_defer_delay(&candidate.tenant))
            .unwrap_or_else(|_| chrono::Duration::zero());

        match claim::process_claim(store, candidate, now, can_run, defer_by).await {
            Ok(ProcessClaim::Claimed(event)) => self.spawn_dispatch(event),
            Ok(ProcessClaim::Deferred(event)) => {
                tracing::debug!("⏳ Tenant {} saturated, event {} deferred", event.tenant, event.id);
            }
            Ok(ProcessClaim::Lost) => {
                tracing::debug!("Process claim for {} lost to another worker", candidate.id);
            }
            Err(e) => tracing::error!("❌ Process claim for {} failed: {e}", candidate.id),
        }
    }

    fn spawn_dispatch(&self, event: Event) {
        let inner = self.inner.clone();
        locked(&inner.in_flight).insert(event.id.clone());
        tokio::spawn(async move { inner.process(event).await });
    }

    /// Sleep out the armed backoff in ticks, returning early on a poll
    /// command or shutdown.
    async fn wait(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let Some(step) = locked(&self.inner.backoff).next_tick() else {
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = self.inner.wake.notified() => return,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn drain(&self) {
        let tick = self.inner.config.min_poll();
        loop {
            let remaining = locked(&self.inner.in_flight).len();
            if remaining == 0 {
                return;
            }
            tracing::info!("⏳ Waiting for {remaining} in-flight events");
            tokio::select! {
                _ = self.inner.drained.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let (poll_in, cur_poll) = {
            let backoff = locked(&inner.backoff);
            (backoff.poll_in(), backoff.cur_poll())
        };
        EngineStats {
            running: self.is_running(),
            poll_in_ms: poll_in.as_millis() as u64,
            cur_poll_ms: cur_poll.as_millis() as u64,
            last_event: locked(&inner.last_event).clone(),
            in_flight: locked(&inner.in_flight).len(),
            num_processed: inner.num_processed.load(Ordering::Relaxed),
            num_loops: inner.num_loops.load(Ordering::Relaxed),
            last_processed: *locked(&inner.last_processed),
        }
    }
}

impl Inner {
    async fn process(&self, event: Event) {
        let outcome = self.dispatcher.dispatch(&event).await;
        let resolution = completion::resolve(&outcome, event.retention);

        match completion::complete(self.store.as_ref(), &event.id, &resolution).await {
            Ok(true) => tracing::debug!("✅ Event {} settled as {:?}", event.id, resolution),
            Ok(false) => tracing::warn!("⚠️ Event {} was no longer processing at completion", event.id),
            Err(e) => tracing::error!("❌ Completing event {} failed: {e}", event.id),
        }

        if let Outcome::Failed(err) = &outcome {
            tracing::warn!("⚠️ Event {} ({}) failed: {err}", event.id, event.event_type());
            self.dispatcher.fire_failure_hook(&event, err).await;
        }

        self.finish(&event.id);
    }

    fn finish(&self, id: &EventId) {
        let empty = {
            let mut in_flight = locked(&self.in_flight);
            in_flight.remove(id);
            in_flight.is_empty()
        };
        self.num_processed.fetch_add(1, Ordering::Relaxed);
        *locked(&self.last_processed) = Some(self.clock.now());

        locked(&self.backoff).reset();
        self.wake.notify_one();
        if empty {
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::store::MemoryEventStore;
    use cadence_core::clock::SystemClock;
    use cadence_core::config::DeploymentConfig;
    use cadence_core::event::{EventPayload, Retention};
    use chrono::Duration;
    use serde_json::json;

    fn engine(store: Arc<MemoryEventStore>) -> EventEngine {
        let dispatcher = Dispatcher::new(Collaborators::new(store.clone()), DeploymentConfig::default());
        let config = EventsConfig {
            min_poll_ms: 10,
            max_poll_ms: 50,
            ..Default::default()
        };
        EventEngine::new(store, dispatcher, config, ShardRange::full(), Arc::new(SystemClock))
    }

    fn console(id: &str, retention: Retention) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::from(id),
            tenant: "acme".into(),
            key: None,
            state: EventState::Pending,
            start: now - Duration::seconds(1),
            schedule: None,
            started: None,
            count: 0,
            sequence: 0,
            shard_key: 42,
            expires_at: None,
            principal: None,
            retention,
            guard: None,
            payload: EventPayload::Console { param: json!({"id": id}) },
            reap: false,
            err: None,
            parent: None,
            parent_key: None,
            created: now,
        }
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let store = Arc::new(MemoryEventStore::new());
        store.insert(&console("a", Retention::COMPLETED)).await.unwrap();
        let engine = engine(store.clone());

        engine.start();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        engine.stop().await;

        let stats = engine.stats();
        assert!(!stats.running);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.num_processed, 1);
        assert!(stats.num_loops >= 1);
        let stored = store.get(&EventId::from("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, EventState::Completed);
        assert_eq!(store.console_lines().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_template_does_not_spin() {
        let store = Arc::new(MemoryEventStore::new());
        let mut template = console("tpl", Retention::NEVER);
        template.state = EventState::Scheduled;
        template.schedule = Some("0 0 30 2 *".into());
        store.insert(&template).await.unwrap();
        let engine = engine(store.clone());

        engine.start();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        engine.stop().await;

        // Every batch is followed by at least one min_poll wait.
        let stats = engine.stats();
        assert!(stats.num_loops >= 2);
        assert!(stats.num_loops <= 25, "{} polls in 200ms", stats.num_loops);
        assert_eq!(stats.last_event, Some(template.id.clone()));
        assert_eq!(store.get(&template.id).await.unwrap().unwrap(), template);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_loop_yields_on_current_thread_runtime() {
        let store = Arc::new(MemoryEventStore::new());
        let mut template = console("tpl", Retention::NEVER);
        template.state = EventState::Scheduled;
        template.schedule = Some("0 0 30 2 *".into());
        store.insert(&template).await.unwrap();
        let engine = engine(store);

        engine.start();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_empty_poll_arms_backoff() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = engine(store);
        engine.start();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(engine.stats().cur_poll_ms > 0);
        engine.poll_handle().poll_now();
        engine.stop().await;
        assert!(!engine.is_running());
    }
}
