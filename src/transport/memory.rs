//! In-process transport for tests and broker-less runs.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{InboundMessage, Subscriptions, Transport};
use crate::error::TransportError;

#[derive(Default)]
pub struct MemoryTransport {
    // ---
    subscriptions: Subscriptions,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message as if it arrived from the broker. Returns the number
    /// of subscribers it reached.
    pub fn inject(&self, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        self.subscriptions.dispatch(topic, payload.as_ref())
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    // ---
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError> {
        Ok(self.subscriptions.add(pattern))
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.subscriptions.remove(pattern);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((topic.to_string(), payload));
        Ok(())
    }
}
