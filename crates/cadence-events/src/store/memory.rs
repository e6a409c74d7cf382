//! Process-local event store. Backs tests and single-process embedding.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::event::{Candidate, Event, EventId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{CandidateQuery, ClaimMatch, ClaimUpdate, EventStore};
use crate::collaborators::{ConsoleLine, ConsoleSink};

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<EventId, Event>>,
    console: Mutex<Vec<ConsoleLine>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> Result<MutexGuard<'_, HashMap<EventId, Event>>> {
        self.events
            .lock()
            .map_err(|e| CadenceError::store(format!("event map poisoned: {e}")))
    }

    /// Snapshot of every stored document, reaped ones included.
    pub fn all(&self) -> Vec<Event> {
        self.events()
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn console_lines(&self) -> Vec<ConsoleLine> {
        self.console.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let events = self.events()?;
        let mut found: Vec<Candidate> = events
            .values()
            .filter(|e| query.matches(e))
            .map(Event::candidate)
            .collect();
        found.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        found.truncate(query.limit);
        Ok(found)
    }

    async fn find_one_and_update(
        &self,
        filter: &ClaimMatch,
        update: &ClaimUpdate,
    ) -> Result<Option<Event>> {
        let mut events = self.events()?;
        let target = match &filter.id {
            Some(id) => events.get_mut(id).filter(|e| filter.matches(e)),
            None => events.values_mut().find(|e| filter.matches(e)),
        };
        Ok(target.map(|event| {
            update.apply(event);
            event.clone()
        }))
    }

    async fn insert(&self, event: &Event) -> Result<()> {
        let mut events = self.events()?;
        if events.contains_key(&event.id) {
            return Err(CadenceError::store(format!("duplicate event id {}", event.id)));
        }
        if let Some(key) = &event.key {
            let taken = events
                .values()
                .any(|e| e.tenant == event.tenant && e.key.as_deref() == Some(key.as_str()));
            if taken {
                return Err(CadenceError::store(format!(
                    "duplicate event key '{key}' for tenant {}",
                    event.tenant
                )));
            }
        }
        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get(&self, id: &EventId) -> Result<Option<Event>> {
        Ok(self.events()?.get(id).cloned())
    }
}

#[async_trait]
impl ConsoleSink for MemoryEventStore {
    async fn write(&self, line: ConsoleLine) -> Result<()> {
        self.console
            .lock()
            .map_err(|e| CadenceError::Console(format!("console buffer poisoned: {e}")))?
            .push(line);
        Ok(())
    }
}
