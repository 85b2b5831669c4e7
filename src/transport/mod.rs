//! Publish/subscribe transport boundary.
//!
//! Subscribers receive messages through an unbounded channel so the delivering
//! side (the MQTT event loop, or a test injecting messages) never waits on the
//! consumer.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

mod memory;
mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

// ---

/// One message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Subscribe to a topic pattern (`+` and `#` wildcards allowed).
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError>;

    /// Drop every subscription on `pattern`; their receivers end.
    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// MQTT topic filter matching. `+` matches one level, a trailing `#` matches
/// the parent level and everything below it.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    // ---
    let mut filter = pattern.split('/');
    let mut levels = topic.split('/');
    loop {
        match (filter.next(), levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(l)) if f == l => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Pattern covering every device's sensor data topic.
pub fn sensor_data_pattern(prefix: &str) -> String {
    format!("{prefix}/sensors/+/data")
}

/// Data topic a device publishes on.
pub fn sensor_data_topic(prefix: &str, device_key: &str) -> String {
    format!("{prefix}/sensors/{device_key}/data")
}

/// Device key embedded in a `{prefix}/sensors/{device}/data` topic.
pub fn device_key_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    // ---
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/sensors/")?;
    let key = rest.strip_suffix("/data")?;
    (!key.is_empty() && !key.contains('/')).then_some(key)
}

/// Publish `{device_id, command, params}` to the device's command topic.
pub async fn send_actuator_command(
    transport: &dyn Transport,
    prefix: &str,
    device_id: &str,
    command: &str,
    params: serde_json::Value,
) -> Result<(), TransportError> {
    // ---
    let topic = format!("{prefix}/actuators/{device_id}/command");
    let payload = serde_json::to_vec(&json!({
        "device_id": device_id,
        "command": command,
        "params": params,
    }))?;
    transport.publish(&topic, payload).await?;
    debug!(%topic, command, "Actuator command sent");
    Ok(())
}

// ---

/// Subscription table shared by the transport implementations.
#[derive(Default)]
pub(crate) struct Subscriptions {
    entries: Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>,
}

impl Subscriptions {
    fn entries(&self) -> MutexGuard<'_, Vec<(String, mpsc::UnboundedSender<InboundMessage>)>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn add(&self, pattern: &str) -> mpsc::UnboundedReceiver<InboundMessage> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries().push((pattern.to_string(), tx));
        rx
    }

    pub(crate) fn remove(&self, pattern: &str) {
        self.entries().retain(|(p, _)| p != pattern);
    }

    /// Distinct patterns currently subscribed.
    pub(crate) fn patterns(&self) -> Vec<String> {
        // ---
        let mut patterns: Vec<String> = self.entries().iter().map(|(p, _)| p.clone()).collect();
        patterns.sort();
        patterns.dedup();
        patterns
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    /// Hand `topic`/`payload` to every matching subscriber, dropping
    /// subscribers whose receiver is gone. Returns the number delivered.
    pub(crate) fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        // ---
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            received_at: Utc::now(),
        };
        let mut delivered = 0;
        self.entries().retain(|(pattern, tx)| {
            if !topic_matches(pattern, topic) {
                return true;
            }
            let open = tx.send(message.clone()).is_ok();
            delivered += usize::from(open);
            open
        });
        delivered
    }
}
