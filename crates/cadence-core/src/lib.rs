//! # Cadence Core
//!
//! Shared building blocks for the Cadence event engine: the event document
//! model, the retention bitmask, structured faults, configuration and the
//! clock abstraction.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CadenceConfig;
pub use error::{CadenceError, EventFault, Result};
pub use event::{Candidate, Event, EventId, EventPayload, EventState, EventType, Retention};
