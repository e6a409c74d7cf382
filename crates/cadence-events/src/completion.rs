//! Completion: settles a processed event as retained history or reaps it.

use cadence_core::error::{EventFault, Result};
use cadence_core::event::{EventId, EventState, Retention};

use crate::dispatch::Outcome;
use crate::store::{ClaimMatch, ClaimUpdate, EventStore};

/// Final disposition of a processed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the document in a terminal state.
    Retain {
        state: EventState,
        err: Option<EventFault>,
    },
    /// Mark for garbage collection and free the dedup key.
    Reap,
}

/// Terminal state plus retention bit for an outcome.
fn terminal(outcome: &Outcome) -> (EventState, Retention) {
    match outcome {
        Outcome::Completed => (EventState::Completed, Retention::COMPLETED),
        Outcome::Skipped => (EventState::Skipped, Retention::SKIPPED),
        Outcome::Failed(_) => (EventState::Failed, Retention::FAILED),
    }
}

pub fn resolve(outcome: &Outcome, retention: Retention) -> Resolution {
    let (state, bit) = terminal(outcome);
    if !retention.contains(bit) {
        return Resolution::Reap;
    }
    let err = match outcome {
        Outcome::Failed(e) => Some(EventFault::from(e)),
        _ => None,
    };
    Resolution::Retain { state, err }
}

/// Apply `resolution` to the event this worker holds in `processing`.
///
/// Returns `false` when the document was no longer ours to settle.
pub async fn complete(store: &dyn EventStore, id: &EventId, resolution: &Resolution) -> Result<bool> {
    let filter = ClaimMatch::id(id).state(EventState::Processing);
    let update = match resolution {
        Resolution::Retain { state, err } => ClaimUpdate {
            state: Some(*state),
            err: err.clone(),
            inc_sequence: true,
            ..Default::default()
        },
        Resolution::Reap => ClaimUpdate {
            reap: true,
            unset_key: true,
            inc_sequence: true,
            ..Default::default()
        },
    };
    Ok(store.find_one_and_update(&filter, &update).await?.is_some())
}
