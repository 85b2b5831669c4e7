//! MQTT transport on `rumqttc`.
//!
//! The event loop is polled on its own task. Inbound publishes are matched
//! against the subscription table and pushed into unbounded channels, so a
//! slow consumer never stalls the connection. Subscriptions are re-issued on
//! every ConnAck, which covers reconnects.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{InboundMessage, Subscriptions, Transport};
use crate::{config::MqttConfig, error::TransportError};

/// Pause between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outgoing request queue depth between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 100;

// ---

pub struct MqttTransport {
    // ---
    client: AsyncClient,
    subscriptions: Arc<Subscriptions>,
    shutdown: CancellationToken,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and start polling the connection in the background.
    /// Connection failures are retried by the event loop task.
    pub fn connect(config: &MqttConfig) -> Self {
        // ---
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keepalive);
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let subscriptions = Arc::new(Subscriptions::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            shutdown.clone(),
        ));
        info!(host = %config.host, port = config.port, "MQTT transport started");

        Self {
            client,
            subscriptions,
            shutdown,
            event_loop: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Disconnect and wait for the event loop task to finish.
    pub async fn shutdown(&self) {
        // ---
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "MQTT disconnect request failed");
        }
        self.shutdown.cancel();

        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "MQTT event loop task failed");
            }
        }
        info!("MQTT transport stopped");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Subscriptions>,
    shutdown: CancellationToken,
) {
    // ---
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let delivered = subscriptions.dispatch(&publish.topic, &publish.payload);
                    if delivered == 0 {
                        debug!(topic = %publish.topic, "No subscriber for message");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    // try_subscribe: awaiting here could block on our own request queue
                    for pattern in subscriptions.patterns() {
                        if let Err(err) = client.try_subscribe(pattern.as_str(), QoS::AtLeastOnce) {
                            warn!(%pattern, error = %err, "Resubscribe failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "MQTT connection error, retrying in {:?}", RECONNECT_DELAY);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    // ---
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError> {
        // ---
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let rx = self.subscriptions.add(pattern);
        self.client.subscribe(pattern, QoS::AtLeastOnce).await?;
        info!(%pattern, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        // ---
        self.subscriptions.remove(pattern);
        if !self.shutdown.is_cancelled() {
            self.client.unsubscribe(pattern).await?;
        }
        info!(%pattern, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // ---
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}
