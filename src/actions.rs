//! Action handlers for triggered rule results.
//!
//! Each handler serves one [`RuleAction`](crate::rules::RuleAction) tag and is
//! registered on the rule engine at startup.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    error::ActionError,
    rules::{ActionContext, ActionHandler, RuleResult, Severity, Threshold},
    store::{NewAlert, Store},
    transport::{send_actuator_command, Transport},
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const WEBHOOK_MAX_URL_LEN: usize = 2048;
const WEBHOOK_ATTEMPTS: u32 = 3;

// ---

/// Persists an alert for each result.
pub struct AlertHandler {
    store: Arc<dyn Store>,
}

impl AlertHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Alert bounds from a result's threshold. A scalar bound is reported as the
/// side the value crossed.
fn alert_bounds(result: &RuleResult) -> (Option<f64>, Option<f64>) {
    match result.threshold {
        Threshold::Range(low, high) => (Some(low), Some(high)),
        Threshold::Scalar(t) if result.value > t => (None, Some(t)),
        Threshold::Scalar(t) => (Some(t), None),
    }
}

#[async_trait]
impl ActionHandler for AlertHandler {
    async fn handle(&self, ctx: &ActionContext, result: &RuleResult) -> Result<(), ActionError> {
        // ---
        let (threshold_min, threshold_max) = alert_bounds(result);
        let alert_type = if result.rule_name.starts_with("phase_") {
            "environment"
        } else {
            "rule"
        };

        let alert = NewAlert {
            alert_type: alert_type.to_string(),
            message: result.message.clone(),
            severity: result.severity,
            zone_id: ctx.zone_id,
            device_id: ctx.device_id,
            sensor_type: Some(result.sensor_kind.to_string()),
            value: Some(result.value),
            threshold_min,
            threshold_max,
        };
        let id = self.store.create_alert(&alert).await?;
        info!(alert = %id, rule = %result.rule_name, severity = %result.severity, "Alert created");
        Ok(())
    }
}

/// Writes the result to the log at a level matching its severity.
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn handle(&self, ctx: &ActionContext, result: &RuleResult) -> Result<(), ActionError> {
        // ---
        let device = ctx.device_key.as_deref().unwrap_or("-");
        match result.severity {
            Severity::Critical => error!(rule = %result.rule_name, device, "{}", result.message),
            Severity::Warning => warn!(rule = %result.rule_name, device, "{}", result.message),
            Severity::Info => info!(rule = %result.rule_name, device, "{}", result.message),
        }
        Ok(())
    }
}

/// Publishes the actuator command named in the rule's action params:
/// `{"device_id": "...", "command": "...", "params": {...}}`.
pub struct ActuatorHandler {
    transport: Arc<dyn Transport>,
    topic_prefix: String,
}

impl ActuatorHandler {
    pub fn new(transport: Arc<dyn Transport>, topic_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            topic_prefix: topic_prefix.into(),
        }
    }
}

#[async_trait]
impl ActionHandler for ActuatorHandler {
    async fn handle(&self, _ctx: &ActionContext, result: &RuleResult) -> Result<(), ActionError> {
        // ---
        let params = &result.action_params;
        let device_id = params
            .get("device_id")
            .and_then(|v| v.as_str())
            .ok_or(ActionError::MissingParam("device_id"))?;
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or(ActionError::MissingParam("command"))?;
        let command_params = params.get("params").cloned().unwrap_or(json!({}));

        send_actuator_command(
            self.transport.as_ref(),
            &self.topic_prefix,
            device_id,
            command,
            command_params,
        )
        .await?;
        info!(rule = %result.rule_name, device = device_id, command, "Actuator command dispatched");
        Ok(())
    }
}

/// POSTs each result as JSON to a fixed HTTPS endpoint, retrying with
/// exponential backoff.
pub struct WebhookHandler {
    client: Client,
    url: Url,
}

impl WebhookHandler {
    pub fn new(url: &str) -> Result<Self, ActionError> {
        // ---
        if url.len() > WEBHOOK_MAX_URL_LEN {
            return Err(ActionError::WebhookRejected(format!(
                "url exceeds {WEBHOOK_MAX_URL_LEN} characters"
            )));
        }
        let url = Url::parse(url)
            .map_err(|err| ActionError::WebhookRejected(format!("invalid url: {err}")))?;
        if url.scheme() != "https" {
            return Err(ActionError::WebhookRejected("url must use https".to_string()));
        }

        let client = Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    /// `scheme://host` only; paths often carry tokens.
    pub fn redacted_target(&self) -> String {
        format!(
            "{}://{}",
            self.url.scheme(),
            self.url.host_str().unwrap_or("unknown")
        )
    }
}

#[async_trait]
impl ActionHandler for WebhookHandler {
    async fn handle(&self, ctx: &ActionContext, result: &RuleResult) -> Result<(), ActionError> {
        // ---
        let payload = json!({
            "rule": result.rule_name,
            "severity": result.severity,
            "message": result.message,
            "sensor_type": result.sensor_kind,
            "value": result.value,
            "threshold": result.threshold,
            "zone_id": ctx.zone_id,
            "device_id": ctx.device_id,
            "device_key": ctx.device_key,
            "timestamp": Utc::now(),
        });

        let mut delay = Duration::from_secs(1);
        for attempt in 1..=WEBHOOK_ATTEMPTS {
            let outcome = self.client.post(self.url.clone()).json(&payload).send().await;
            let last = attempt == WEBHOOK_ATTEMPTS;

            match outcome {
                Ok(response) if response.status().is_success() => {
                    info!(target_url = %self.redacted_target(), rule = %result.rule_name, attempt, "Webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(target_url = %self.redacted_target(), status = %response.status(), attempt, "Webhook returned error status");
                    if last {
                        return Err(ActionError::WebhookRejected(format!(
                            "status {} after {attempt} attempts",
                            response.status()
                        )));
                    }
                }
                Err(err) => {
                    warn!(target_url = %self.redacted_target(), error = %err, attempt, "Webhook request failed");
                    if last {
                        return Err(err.into());
                    }
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        catalog::PhaseCatalog,
        models::SensorKind,
        rules::{Operator, Rule, RuleAction, RuleEngine},
        store::MemoryStore,
        transport::MemoryTransport,
    };
    use std::collections::HashMap;
    use uuid::Uuid;

    fn create_test_context() -> ActionContext {
        ActionContext {
            zone_id: Some(Uuid::new_v4()),
            device_id: Some(Uuid::new_v4()),
            device_key: Some("esp01".to_string()),
        }
    }

    #[tokio::test]
    async fn test_alert_handler_persists_phase_violation() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let handler = AlertHandler::new(store.clone());
        let engine = RuleEngine::new(Arc::new(PhaseCatalog::builtin().unwrap()));
        let readings = HashMap::from([(SensorKind::Humidity, 38.0)]);
        let result = &engine.evaluate_phase("flowering_mid", &readings)[0];
        let ctx = create_test_context();

        handler.handle(&ctx, result).await.unwrap();

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "environment");
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].zone_id, ctx.zone_id);
        assert_eq!(alerts[0].sensor_type.as_deref(), Some("humidity"));
        assert_eq!((alerts[0].threshold_min, alerts[0].threshold_max), (Some(40.0), Some(50.0)));
    }

    #[tokio::test]
    async fn test_alert_handler_scalar_bounds() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let handler = AlertHandler::new(store.clone());
        let engine = RuleEngine::new(Arc::new(PhaseCatalog::builtin().unwrap()));
        let result = &engine.evaluate(&SensorKind::Ph, 4.0)[0];

        handler.handle(&ActionContext::default(), result).await.unwrap();

        let alerts = store.alerts();
        assert_eq!(alerts[0].alert_type, "rule");
        assert_eq!((alerts[0].threshold_min, alerts[0].threshold_max), (Some(4.5), None));
    }

    #[tokio::test]
    async fn test_actuator_handler_publishes_command() {
        // ---
        let transport = Arc::new(MemoryTransport::new());
        let handler = ActuatorHandler::new(transport.clone(), "tendrill");
        let rule = Rule::new("dehumidify", SensorKind::Humidity, Operator::Gt, Threshold::Scalar(70.0))
            .with_action(
                RuleAction::Actuator,
                json!({"device_id": "dehum01", "command": "on", "params": {"minutes": 15}}),
            );

        handler
            .handle(&create_test_context(), &rule.evaluate(80.0))
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "tendrill/actuators/dehum01/command");
    }

    #[tokio::test]
    async fn test_actuator_handler_requires_params() {
        // ---
        let handler = ActuatorHandler::new(Arc::new(MemoryTransport::new()), "tendrill");
        let rule = Rule::new("fan", SensorKind::Temperature, Operator::Gt, Threshold::Scalar(28.0))
            .with_action(RuleAction::Actuator, json!({"device_id": "fan01"}));

        let err = handler
            .handle(&create_test_context(), &rule.evaluate(30.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::MissingParam("command")));
    }

    #[test]
    fn test_webhook_requires_https() {
        // ---
        assert!(matches!(
            WebhookHandler::new("http://hooks.example.com/grow"),
            Err(ActionError::WebhookRejected(_))
        ));
        assert!(WebhookHandler::new("not a url").is_err());

        let long = format!("https://example.com/{}", "a".repeat(WEBHOOK_MAX_URL_LEN));
        assert!(WebhookHandler::new(&long).is_err());

        let handler = WebhookHandler::new("https://hooks.example.com/grow/secret-token").unwrap();
        assert_eq!(handler.redacted_target(), "https://hooks.example.com");
    }

    #[tokio::test]
    async fn test_log_handler_never_fails() {
        // ---
        let engine = RuleEngine::new(Arc::new(PhaseCatalog::builtin().unwrap()));
        for result in engine.evaluate(&SensorKind::Temperature, 40.0) {
            LogHandler
                .handle(&create_test_context(), &result)
                .await
                .unwrap();
        }
    }
}
