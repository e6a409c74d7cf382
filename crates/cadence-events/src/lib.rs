//! # Cadence Events
//!
//! Durable event polling and scheduling engine.
//! Events are documents in a shared store; any number of workers poll their
//! shard of it and race for ownership with optimistic, versioned claims.
//!
//! ## Architecture
//! ```text
//! EventEngine (tokio run loop, adaptive backoff)
//!   ├── PollCursor: due pending/scheduled docs in my shard range, by start
//!   ├── expiresAt passed → expire claim → reap
//!   ├── scheduled        → schedule claim → next cron fire + spawned instance
//!   └── pending          → process claim → Dispatcher (spawned, capped)
//!                            ├── script        (ScriptSandbox)
//!                            ├── driver        (Driver)
//!                            ├── console       (ConsoleSink)
//!                            └── notification  (Notifier / webhook)
//!                          → Completion: retain per bitmask, or reap
//!
//! PollRouter: "poll now" → shard owner (or everyone) → reset backoff
//! ```

pub mod backoff;
pub mod claim;
pub mod collaborators;
pub mod command;
pub mod completion;
pub mod cron;
pub mod cursor;
pub mod dispatch;
pub mod engine;
pub mod enqueue;
pub mod notify;
pub mod reschedule;
pub mod shard;
pub mod store;

pub use backoff::Backoff;
pub use collaborators::{Collaborators, Principal};
pub use command::{LocalPollTransport, PollHandle, PollRouter, PollTransport};
pub use completion::Resolution;
pub use dispatch::{Dispatcher, Outcome};
pub use engine::{EngineStats, EventEngine};
pub use enqueue::{NewEvent, enqueue};
pub use notify::WebhookNotifier;
pub use shard::{ClusterView, ShardMap, ShardRange};
pub use store::{EventStore, MemoryEventStore, SqliteEventStore};
