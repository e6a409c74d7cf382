//! Dispatcher: executes a claimed one-shot event against its collaborator.
//! Faults never escape: every failure comes back as [`Outcome::Failed`].

use cadence_core::config::DeploymentConfig;
use cadence_core::error::{CadenceError, EventFault, Result};
use cadence_core::event::{Event, EventPayload};
use serde_json::{Map, Value};

use crate::collaborators::{Collaborators, ConsoleLine, DriverCall, NotificationRequest, Principal};

/// Trigger fired for tenants that registered one when an event fails.
pub const FAILURE_HOOK: &str = "err.events.failed";

/// Largest serialized console payload accepted.
pub const MAX_CONSOLE_PAYLOAD: usize = 8192;

/// How a dispatch settled.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// The conditional guard evaluated falsy; no executor ran.
    Skipped,
    Failed(CadenceError),
}

pub struct Dispatcher {
    collaborators: Collaborators,
    deployment: DeploymentConfig,
}

impl Dispatcher {
    pub fn new(collaborators: Collaborators, deployment: DeploymentConfig) -> Self {
        Self {
            collaborators,
            deployment,
        }
    }

    /// `false` when the tenant's script capacity is saturated.
    pub fn can_run_script(&self, tenant: &str) -> bool {
        self.collaborators.scripts.can_run_script(tenant)
    }

    pub async fn dispatch(&self, event: &Event) -> Outcome {
        match self.execute(event).await {
            Ok(true) => Outcome::Completed,
            Ok(false) => Outcome::Skipped,
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Runs the event. `Ok(false)` means the guard skipped it.
    async fn execute(&self, event: &Event) -> Result<bool> {
        let principal = self
            .collaborators
            .principals
            .resolve(&event.tenant, event.principal.as_deref())
            .await?;

        if let Some(guard) = &event.guard {
            let root = serde_json::to_value(event)?;
            if !self.collaborators.guards.evaluate(&principal, guard, &root).await? {
                tracing::debug!("⏭️ Event {} skipped by guard", event.id);
                return Ok(false);
            }
        }

        match &event.payload {
            EventPayload::Script { event: name, param } => {
                self.run_script(event, &principal, name, param).await?
            }
            EventPayload::Driver {
                options,
                privileged,
            } => self.run_driver(&principal, options, *privileged).await?,
            EventPayload::Console { param } => self.write_console(event, param).await?,
            EventPayload::Notification {
                name,
                variables,
                options,
            } => self.send_notification(&principal, name, variables, options).await?,
        }
        Ok(true)
    }

    async fn run_script(
        &self,
        event: &Event,
        principal: &Principal,
        name: &str,
        param: &Value,
    ) -> Result<()> {
        let scripts = &self.collaborators.scripts;
        let listeners = scripts.listeners(&event.tenant, name).await?;
        if listeners.is_empty() {
            tracing::debug!("No listeners for '{}' in tenant {}", name, event.tenant);
            return Ok(());
        }
        let context = event.read_view();
        scripts.run(principal, &listeners, name, param, &context).await
    }

    async fn run_driver(&self, principal: &Principal, options: &Value, privileged: bool) -> Result<()> {
        let target = |field: &str| {
            options
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| CadenceError::Driver(format!("options.{field} is required")))
        };
        let call = DriverCall {
            object: target("object")?,
            operation: target("operation")?,
            options: options.clone(),
            privileged: privileged.then(|| options.clone()),
        };
        self.collaborators.driver.execute_operation(principal, &call).await
    }

    async fn write_console(&self, event: &Event, param: &Value) -> Result<()> {
        if !self.deployment.allows_console() {
            return Ok(());
        }
        let message = serde_json::to_string(param)?;
        if message.len() > MAX_CONSOLE_PAYLOAD {
            return Err(CadenceError::PayloadTooLarge {
                size: message.len(),
                max: MAX_CONSOLE_PAYLOAD,
            });
        }
        let line = ConsoleLine {
            tenant: event.tenant.clone(),
            date: chrono::Utc::now(),
            level: "log".into(),
            message,
        };
        if let Err(e) = self.collaborators.console.write(line).await {
            tracing::debug!("Console line for event {} dropped: {e}", event.id);
        }
        Ok(())
    }

    async fn send_notification(
        &self,
        principal: &Principal,
        name: &Option<String>,
        variables: &Value,
        options: &Value,
    ) -> Result<()> {
        let mut options = match options {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(CadenceError::Notification(
                    "notification options must be an object".into(),
                ));
            }
        };
        // This send is the delivery itself, never another enqueue.
        options.insert("queue".into(), Value::Bool(false));

        let request = NotificationRequest {
            name: name.clone(),
            variables: if variables.is_null() {
                Value::Object(Map::new())
            } else {
                variables.clone()
            },
            options: Value::Object(options),
        };
        self.collaborators.notifier.send(principal, &request).await
    }

    /// Best-effort failure trigger. Its own failures are swallowed.
    pub async fn fire_failure_hook(&self, event: &Event, err: &CadenceError) {
        let fault = EventFault::from(err);
        let context = event.read_view();
        if let Err(e) = self
            .collaborators
            .failure_hook
            .fire_if_registered(&event.tenant, FAILURE_HOOK, &context, &fault)
            .await
        {
            tracing::debug!("Failure hook for event {} failed: {e}", event.id);
        }
    }
}
