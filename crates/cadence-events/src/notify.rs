//! Webhook notification delivery.
//! POSTs each notification event as JSON to the configured endpoint.

use async_trait::async_trait;
use cadence_core::config::NotifyConfig;
use cadence_core::error::{CadenceError, Result};
use serde_json::Value;
use std::time::Duration;

use crate::collaborators::{NotificationRequest, Notifier, Principal};

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        if config.webhook_url.trim().is_empty() {
            return None;
        }
        Some(Self::new(
            config.webhook_url.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// JSON body sent for one notification.
pub fn webhook_body(principal: &Principal, request: &NotificationRequest) -> Value {
    serde_json::json!({
        "tenant": principal.tenant,
        "principal": principal.id,
        "name": request.name,
        "variables": request.variables,
        "options": request.options,
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, principal: &Principal, request: &NotificationRequest) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&webhook_body(principal, request))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CadenceError::Notification(format!("webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!(
                "✅ Notification {} sent for tenant {}",
                request.name.as_deref().unwrap_or("(inline)"),
                principal.tenant
            );
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(CadenceError::Notification(format!("webhook error {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_config_requires_url() {
        assert!(WebhookNotifier::from_config(&NotifyConfig::default()).is_none());
        let config = NotifyConfig {
            webhook_url: "http://localhost:9000/notify".into(),
            timeout_secs: 5,
        };
        let notifier = WebhookNotifier::from_config(&config).unwrap();
        assert_eq!(notifier.url(), "http://localhost:9000/notify");
        assert_eq!(notifier.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_webhook_body() {
        let principal = Principal {
            tenant: "acme".into(),
            id: Some("user-1".into()),
        };
        let request = NotificationRequest {
            name: None,
            variables: json!({"a": 1}),
            options: json!({"queue": false}),
        };
        let body = webhook_body(&principal, &request);
        assert_eq!(body["tenant"], "acme");
        assert_eq!(body["principal"], "user-1");
        assert!(body["name"].is_null());
        assert_eq!(body["options"]["queue"], json!(false));
    }
}
