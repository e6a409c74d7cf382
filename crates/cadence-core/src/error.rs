//! Error types shared by every Cadence crate.

use serde::{Deserialize, Serialize};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Everything that can go wrong inside the engine or one of its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid schedule: {0}")]
    Cron(String),

    #[error("Principal error: {0}")]
    Principal(String),

    #[error("Guard error: {0}")]
    Guard(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Console error: {0}")]
    Console(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("{}", .0.message)]
    Fault(EventFault),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CadenceError {
    /// Stable dotted code recorded on failed events.
    pub fn code(&self) -> &str {
        match self {
            Self::Store(_) => "store.error",
            Self::Config(_) => "config.invalid",
            Self::Cron(_) => "cron.invalid",
            Self::Principal(_) => "principal.unresolved",
            Self::Guard(_) => "guard.error",
            Self::Script(_) => "script.error",
            Self::Driver(_) => "driver.error",
            Self::Notification(_) => "notification.error",
            Self::Console(_) => "console.error",
            Self::PayloadTooLarge { .. } => "payload.tooLarge",
            Self::Fault(fault) => &fault.code,
            Self::InvalidEvent(_) => "event.invalid",
            Self::Io(_) => "io.error",
            Self::Json(_) => "json.error",
            Self::Other(_) => "error.unspecified",
        }
    }

    /// HTTP-like status used when the fault is surfaced to tenants.
    pub fn status(&self) -> u16 {
        match self {
            Self::Config(_) | Self::Cron(_) | Self::InvalidEvent(_) | Self::Json(_) => 400,
            Self::Principal(_) => 403,
            Self::PayloadTooLarge { .. } => 413,
            Self::Fault(fault) => fault.status,
            _ => 500,
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Structured error persisted on a failed event document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFault {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

fn default_status() -> u16 { 500 }

impl EventFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            reason: None,
            status: default_status(),
            stack: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Copy safe for persistence. Stacks never reach the store.
    pub fn sanitized(&self) -> Self {
        Self {
            stack: None,
            ..self.clone()
        }
    }
}

impl From<&CadenceError> for EventFault {
    fn from(err: &CadenceError) -> Self {
        match err {
            CadenceError::Fault(fault) => fault.sanitized(),
            other => Self {
                code: other.code().to_string(),
                message: other.to_string(),
                reason: None,
                status: other.status(),
                stack: None,
            },
        }
    }
}
