//! External collaborators the dispatcher calls into.
//!
//! The engine owns none of these concerns: principals and permissions, the
//! script sandbox, object drivers, notification delivery and failure triggers
//! all live elsewhere in the platform. Each is a trait so a host can plug in
//! its own implementation; the built-ins here are what the standalone worker
//! binary runs with.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, EventFault, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Identity an event is dispatched as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub tenant: String,
    /// `None` for the synthesized anonymous principal.
    pub id: Option<String>,
}

impl Principal {
    pub fn anonymous(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            id: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_none()
    }
}

#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    /// Resolve `principal` within `tenant`, or synthesize an anonymous one.
    async fn resolve(&self, tenant: &str, principal: Option<&str>) -> Result<Principal>;
}

#[async_trait]
pub trait GuardEvaluator: Send + Sync {
    /// Evaluate a conditional guard with the event document as `$$ROOT`.
    async fn evaluate(&self, principal: &Principal, expression: &Value, root: &Value) -> Result<bool>;
}

/// A compiled runtime listener bound to an event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub event: String,
}

#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    /// `false` when the tenant's script capacity is saturated.
    fn can_run_script(&self, _tenant: &str) -> bool {
        true
    }

    /// Listeners in the tenant's compiled runtime declared for `event`.
    async fn listeners(&self, tenant: &str, event: &str) -> Result<Vec<Listener>>;

    async fn run(
        &self,
        principal: &Principal,
        listeners: &[Listener],
        event: &str,
        param: &Value,
        context: &Value,
    ) -> Result<()>;
}

/// One object operation requested by a driver event.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverCall {
    pub object: String,
    pub operation: String,
    pub options: Value,
    /// Present only for privileged events; carries the same options elevated.
    pub privileged: Option<Value>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn execute_operation(&self, principal: &Principal, call: &DriverCall) -> Result<()>;
}

/// A notification send. `options.queue` is always `false`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub variables: Value,
    pub options: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, principal: &Principal, request: &NotificationRequest) -> Result<()>;
}

/// A persisted console log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub tenant: String,
    pub date: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[async_trait]
pub trait ConsoleSink: Send + Sync {
    async fn write(&self, line: ConsoleLine) -> Result<()>;
}

#[async_trait]
pub trait FailureHook: Send + Sync {
    /// Fire `hook` for `tenant` if one is registered. Best-effort.
    async fn fire_if_registered(
        &self,
        tenant: &str,
        hook: &str,
        context: &Value,
        err: &EventFault,
    ) -> Result<()>;
}

/// Everything the dispatcher talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub principals: Arc<dyn PrincipalResolver>,
    pub guards: Arc<dyn GuardEvaluator>,
    pub scripts: Arc<dyn ScriptSandbox>,
    pub driver: Arc<dyn Driver>,
    pub notifier: Arc<dyn Notifier>,
    pub console: Arc<dyn ConsoleSink>,
    pub failure_hook: Arc<dyn FailureHook>,
}

impl Collaborators {
    /// Built-in collaborators writing console lines to `console`.
    pub fn new(console: Arc<dyn ConsoleSink>) -> Self {
        Self {
            principals: Arc::new(TenantPrincipalResolver),
            guards: Arc::new(JsonGuardEvaluator),
            scripts: Arc::new(NoScriptSandbox),
            driver: Arc::new(RejectingDriver),
            notifier: Arc::new(TracingNotifier),
            console,
            failure_hook: Arc::new(NoFailureHook),
        }
    }

    pub fn with_principals(mut self, principals: Arc<dyn PrincipalResolver>) -> Self {
        self.principals = principals;
        self
    }

    pub fn with_guards(mut self, guards: Arc<dyn GuardEvaluator>) -> Self {
        self.guards = guards;
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptSandbox>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.failure_hook = hook;
        self
    }
}

// ─── Built-ins ────────────────────────────────────────────

/// Takes principal ids at face value within their tenant.
pub struct TenantPrincipalResolver;

#[async_trait]
impl PrincipalResolver for TenantPrincipalResolver {
    async fn resolve(&self, tenant: &str, principal: Option<&str>) -> Result<Principal> {
        match principal {
            None => Ok(Principal::anonymous(tenant)),
            Some(id) if id.trim().is_empty() => Err(CadenceError::Principal(format!(
                "empty principal id for tenant {tenant}"
            ))),
            Some(id) => Ok(Principal {
                tenant: tenant.to_string(),
                id: Some(id.to_string()),
            }),
        }
    }
}

/// Minimal JSON guard language.
///
/// Literals use JavaScript-style truthiness. Strings `"true"`/`"false"` are
/// booleans and `"$$ROOT.a.b"` reads a path from the document. Objects support
/// `$not`, `$and`, `$or` and `$eq`.
pub struct JsonGuardEvaluator;

impl JsonGuardEvaluator {
    pub fn eval(expression: &Value, root: &Value) -> Result<bool> {
        match expression {
            Value::String(s) if s == "true" => Ok(true),
            Value::String(s) if s == "false" => Ok(false),
            Value::Object(map) => {
                let (op, arg) = match map.iter().next() {
                    Some(entry) if map.len() == 1 => entry,
                    _ => {
                        return Err(CadenceError::Guard(
                            "guard objects must hold exactly one operator".into(),
                        ));
                    }
                };
                match op.as_str() {
                    "$not" => Ok(!Self::eval(arg, root)?),
                    "$and" => Self::operands(op, arg)?
                        .iter()
                        .try_fold(true, |acc, v| Ok(acc && Self::eval(v, root)?)),
                    "$or" => Self::operands(op, arg)?
                        .iter()
                        .try_fold(false, |acc, v| Ok(acc || Self::eval(v, root)?)),
                    "$eq" => match Self::operands(op, arg)? {
                        [a, b] => Ok(Self::resolve(a, root) == Self::resolve(b, root)),
                        _ => Err(CadenceError::Guard("$eq takes two operands".into())),
                    },
                    other => Err(CadenceError::Guard(format!("unsupported operator {other}"))),
                }
            }
            Value::Array(_) => Err(CadenceError::Guard(
                "a guard must be a literal, a $$ROOT path or an operator".into(),
            )),
            literal => Ok(truthy(&Self::resolve(literal, root))),
        }
    }

    fn operands<'a>(op: &str, arg: &'a Value) -> Result<&'a [Value]> {
        arg.as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| CadenceError::Guard(format!("{op} expects an array")))
    }

    fn resolve(value: &Value, root: &Value) -> Value {
        match value.as_str() {
            Some("$$ROOT") => root.clone(),
            Some(s) => match s.strip_prefix("$$ROOT.") {
                Some(path) => path
                    .split('.')
                    .try_fold(root, |node, part| node.get(part))
                    .cloned()
                    .unwrap_or(Value::Null),
                None => value.clone(),
            },
            None => value.clone(),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[async_trait]
impl GuardEvaluator for JsonGuardEvaluator {
    async fn evaluate(&self, _principal: &Principal, expression: &Value, root: &Value) -> Result<bool> {
        Self::eval(expression, root)
    }
}

/// A sandbox with no compiled runtime: every script event is a no-op.
pub struct NoScriptSandbox;

#[async_trait]
impl ScriptSandbox for NoScriptSandbox {
    async fn listeners(&self, _tenant: &str, _event: &str) -> Result<Vec<Listener>> {
        Ok(Vec::new())
    }

    async fn run(
        &self,
        _principal: &Principal,
        _listeners: &[Listener],
        event: &str,
        _param: &Value,
        _context: &Value,
    ) -> Result<()> {
        Err(CadenceError::Script(format!("no sandbox available to run '{event}'")))
    }
}

/// Fails every driver event; used where no object runtime is wired in.
pub struct RejectingDriver;

#[async_trait]
impl Driver for RejectingDriver {
    async fn execute_operation(&self, _principal: &Principal, call: &DriverCall) -> Result<()> {
        Err(CadenceError::Driver(format!(
            "no driver registered for {}.{}",
            call.object, call.operation
        )))
    }
}

/// Records notifications in the log instead of delivering them.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, principal: &Principal, request: &NotificationRequest) -> Result<()> {
        tracing::info!(
            "📢 Notification for tenant {}: {} {}",
            principal.tenant,
            request.name.as_deref().unwrap_or("(inline)"),
            request.variables
        );
        Ok(())
    }
}

/// No tenant has a failure trigger registered.
pub struct NoFailureHook;

#[async_trait]
impl FailureHook for NoFailureHook {
    async fn fire_if_registered(
        &self,
        _tenant: &str,
        _hook: &str,
        _context: &Value,
        _err: &EventFault,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guard_literals() {
        let root = json!({});
        assert!(JsonGuardEvaluator::eval(&json!(true), &root).unwrap());
        assert!(!JsonGuardEvaluator::eval(&json!(false), &root).unwrap());
        assert!(!JsonGuardEvaluator::eval(&json!("false"), &root).unwrap());
        assert!(JsonGuardEvaluator::eval(&json!("true"), &root).unwrap());
        assert!(!JsonGuardEvaluator::eval(&json!(0), &root).unwrap());
        assert!(!JsonGuardEvaluator::eval(&Value::Null, &root).unwrap());
    }

    #[test]
    fn test_guard_root_paths() {
        let root = json!({"param": {"enabled": true, "count": 0}, "tenant": "acme"});
        assert!(JsonGuardEvaluator::eval(&json!("$$ROOT.param.enabled"), &root).unwrap());
        assert!(!JsonGuardEvaluator::eval(&json!("$$ROOT.param.count"), &root).unwrap());
        assert!(!JsonGuardEvaluator::eval(&json!("$$ROOT.param.missing"), &root).unwrap());
        assert!(
            JsonGuardEvaluator::eval(&json!({"$eq": ["$$ROOT.tenant", "acme"]}), &root).unwrap()
        );
        assert!(
            !JsonGuardEvaluator::eval(&json!({"$not": "$$ROOT.param.enabled"}), &root).unwrap()
        );
        assert!(
            JsonGuardEvaluator::eval(
                &json!({"$or": [false, {"$and": ["$$ROOT.param.enabled", true]}]}),
                &root
            )
            .unwrap()
        );
    }

    #[test]
    fn test_guard_rejects_malformed() {
        let root = json!({});
        assert!(JsonGuardEvaluator::eval(&json!({"$unknown": 1}), &root).is_err());
        assert!(JsonGuardEvaluator::eval(&json!({"$eq": [1]}), &root).is_err());
        assert!(JsonGuardEvaluator::eval(&json!([true]), &root).is_err());
    }

    #[tokio::test]
    async fn test_principal_resolution() {
        let resolver = TenantPrincipalResolver;
        let anon = resolver.resolve("acme", None).await.unwrap();
        assert!(anon.is_anonymous());
        assert_eq!(anon.tenant, "acme");
        let user = resolver.resolve("acme", Some("user-1")).await.unwrap();
        assert_eq!(user.id.as_deref(), Some("user-1"));
        assert!(resolver.resolve("acme", Some(" ")).await.is_err());
    }
}
