//! Ingestion coordinator: transport messages in, readings and alerts out.
//!
//! A dispatcher task receives every message on the sensor data pattern and
//! routes it to a per-topic lane. Each lane is a task processing its device's
//! messages strictly in delivery order; lanes for different devices run
//! concurrently. Nothing in the message path can fail the coordinator: bad
//! payloads and unknown identities are counted, logged and dropped.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    batch::BatchWriter,
    error::TransportError,
    models::{Reading, SensorBatch, SensorKind},
    phases::PhaseManager,
    resolver::IdentityResolver,
    rules::{ActionContext, RuleEngine},
    store::Store,
    transport::{device_key_from_topic, sensor_data_pattern, InboundMessage, Transport},
};

/// A lane with nothing to do for this long is closed.
const LANE_IDLE: Duration = Duration::from_secs(60);

// ---

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    unresolved: AtomicU64,
    readings_queued: AtomicU64,
    alerts_dispatched: AtomicU64,
    active_lanes: AtomicU64,
}

/// Point-in-time copy of the coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    pub received: u64,
    pub malformed: u64,
    pub unresolved: u64,
    pub readings_queued: u64,
    pub alerts_dispatched: u64,
    pub active_lanes: u64,
}

/// Components a message passes through, shared by every lane.
#[derive(Clone)]
pub struct Pipeline {
    // ---
    pub store: Arc<dyn Store>,
    pub resolver: Arc<IdentityResolver>,
    pub batch: Arc<BatchWriter>,
    pub rules: Arc<RuleEngine>,
    pub phases: Arc<PhaseManager>,
    pub topic_prefix: String,
}

impl Pipeline {
    /// Run one message through decode, resolve, enqueue, evaluate and
    /// last-seen update. Returns false when the message named no known
    /// device, so its lane is not worth keeping.
    async fn process(&self, message: InboundMessage, counters: &Counters) -> bool {
        // ---
        let topic = message.topic.as_str();

        let batch = match SensorBatch::decode(&message.payload) {
            Ok(batch) => batch,
            Err(err) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %err, "Dropping malformed sensor payload");
                return false;
            }
        };

        if let Some(topic_device) = device_key_from_topic(&self.topic_prefix, topic) {
            if topic_device != batch.device_id {
                warn!(
                    topic_device,
                    payload_device = %batch.device_id,
                    "Device id in topic does not match payload"
                );
            }
        }

        let Some((device_id, zone_id)) = self.resolve(&batch).await else {
            counters.unresolved.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        for reading in Reading::from_batch(&batch, device_id, zone_id, message.received_at) {
            if let Err(err) = self.batch.enqueue(reading) {
                error!(device = %batch.device_id, error = %err, "Reading not queued");
                break;
            }
            counters.readings_queued.fetch_add(1, Ordering::Relaxed);
        }

        let dispatched = self.evaluate(&batch, device_id, zone_id).await;
        counters
            .alerts_dispatched
            .fetch_add(dispatched as u64, Ordering::Relaxed);

        if let Err(err) = self
            .store
            .update_device_last_seen(device_id, message.received_at)
            .await
        {
            warn!(device = %batch.device_id, error = %err, "Failed to update last seen");
        }

        debug!(device = %batch.device_id, readings = batch.readings.len(), "Sensor data queued");
        true
    }

    async fn resolve(&self, batch: &SensorBatch) -> Option<(Uuid, Uuid)> {
        // ---
        let device = self.resolver.resolve_device(&batch.device_id).await;
        let zone = self.resolver.resolve_zone(&batch.zone_id).await;

        match (device, zone) {
            (Ok(Some(device)), Ok(Some(zone))) => Some((device, zone)),
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    device = %batch.device_id,
                    zone = %batch.zone_id,
                    error = %err,
                    "Identity lookup failed, dropping message"
                );
                None
            }
            _ => {
                warn!(
                    device = %batch.device_id,
                    zone = %batch.zone_id,
                    "Unknown device or zone, dropping message"
                );
                None
            }
        }
    }

    /// Check the readings against the zone's phase targets and the absolute
    /// threshold rules, dispatching whatever triggers. Handlers run detached.
    async fn evaluate(&self, batch: &SensorBatch, device_id: Uuid, zone_id: Uuid) -> usize {
        // ---
        // First reading of each kind, like `SensorBatch::get_reading`
        let mut values: HashMap<SensorKind, f64> = HashMap::new();
        for reading in &batch.readings {
            values.entry(reading.kind.clone()).or_insert(reading.value);
        }

        let mut results = Vec::new();
        match self.phases.current_zone_phase(zone_id).await {
            Ok(Some(phase)) => results.extend(self.rules.evaluate_phase(phase.as_str(), &values)),
            Ok(None) => debug!(zone = %zone_id, "Zone has no phase, skipping target check"),
            Err(err) => warn!(zone = %zone_id, error = %err, "Cannot read zone phase"),
        }
        for (kind, value) in &values {
            results.extend(self.rules.evaluate(kind, *value));
        }

        if results.is_empty() {
            return 0;
        }
        let ctx = ActionContext {
            zone_id: Some(zone_id),
            device_id: Some(device_id),
            device_key: Some(batch.device_id.clone()),
        };
        self.rules.execute_actions(&ctx, &results)
    }
}

// ---

pub struct IngestionCoordinator {
    // ---
    transport: Arc<dyn Transport>,
    pipeline: Pipeline,
    pattern: String,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    lanes: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionCoordinator {
    pub fn new(transport: Arc<dyn Transport>, pipeline: Pipeline) -> Self {
        // ---
        let pattern = sensor_data_pattern(&pipeline.topic_prefix);
        Self {
            transport,
            pipeline,
            pattern,
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
            lanes: TaskTracker::new(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Subscribe to the sensor data pattern and start dispatching.
    pub async fn start(&self) -> Result<(), TransportError> {
        // ---
        let rx = self.transport.subscribe(&self.pattern).await?;

        let handle = tokio::spawn(dispatch(
            rx,
            self.pipeline.clone(),
            self.counters.clone(),
            self.lanes.clone(),
            self.shutdown.clone(),
        ));
        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        info!(pattern = %self.pattern, "Sensor ingestion started");
        Ok(())
    }

    /// Unsubscribe, finish every message already received, then flush the
    /// batch writer.
    pub async fn stop(&self) {
        // ---
        if let Err(err) = self.transport.unsubscribe(&self.pattern).await {
            warn!(pattern = %self.pattern, error = %err, "Unsubscribe failed");
        }
        self.shutdown.cancel();

        let handle = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "Ingestion dispatcher failed");
            }
        }
        self.lanes.close();
        self.lanes.wait().await;
        self.pipeline.rules.wait_for_actions().await;

        self.pipeline.batch.stop().await;
        info!(stats = ?self.stats(), "Sensor ingestion stopped");
    }

    pub fn stats(&self) -> IngestionStats {
        // ---
        let c = &self.counters;
        IngestionStats {
            received: c.received.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            unresolved: c.unresolved.load(Ordering::Relaxed),
            readings_queued: c.readings_queued.load(Ordering::Relaxed),
            alerts_dispatched: c.alerts_dispatched.load(Ordering::Relaxed),
            active_lanes: c.active_lanes.load(Ordering::Relaxed),
        }
    }
}

/// One device topic's ordered processing queue.
struct Lane {
    tx: mpsc::UnboundedSender<InboundMessage>,
    /// Messages sent to the lane and not yet processed.
    pending: Arc<AtomicUsize>,
    last_used: Instant,
}

/// Routes messages to per-topic lanes.
///
/// Only the dispatcher sends to a lane, so a lane with nothing pending can be
/// dropped without reordering: its task has no work left and exits. Lanes are
/// dropped when their last message did not resolve to a device, and by a
/// periodic sweep once idle for `LANE_IDLE`.
struct Dispatcher {
    lanes: HashMap<String, Lane>,
    pipeline: Pipeline,
    counters: Arc<Counters>,
    tracker: TaskTracker,
    retire_tx: mpsc::UnboundedSender<String>,
}

impl Dispatcher {
    fn route(&mut self, message: InboundMessage) {
        // ---
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let topic = message.topic.clone();

        let lane = match self.lanes.entry(topic.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(0));
                self.tracker.spawn(run_lane(
                    entry.key().clone(),
                    rx,
                    pending.clone(),
                    self.pipeline.clone(),
                    self.counters.clone(),
                    self.retire_tx.clone(),
                ));
                debug!(topic = %entry.key(), "Opened device lane");
                entry.insert(Lane {
                    tx,
                    pending,
                    last_used: Instant::now(),
                })
            }
        };

        lane.pending.fetch_add(1, Ordering::SeqCst);
        lane.last_used = Instant::now();
        if lane.tx.send(message).is_err() {
            error!(%topic, "Device lane closed unexpectedly, message dropped");
            self.lanes.remove(&topic);
        }
        self.publish_lane_count();
    }

    /// Drop the lane for `topic` if it has nothing left to process.
    fn retire(&mut self, topic: &str) {
        // ---
        let idle = self
            .lanes
            .get(topic)
            .is_some_and(|lane| lane.pending.load(Ordering::SeqCst) == 0);
        if idle {
            self.lanes.remove(topic);
            debug!(topic, "Closed unresolved device lane");
            self.publish_lane_count();
        }
    }

    fn sweep_idle(&mut self) {
        // ---
        let before = self.lanes.len();
        self.lanes.retain(|_, lane| {
            lane.pending.load(Ordering::SeqCst) > 0 || lane.last_used.elapsed() < LANE_IDLE
        });
        if self.lanes.len() != before {
            debug!(closed = before - self.lanes.len(), "Closed idle device lanes");
            self.publish_lane_count();
        }
    }

    fn publish_lane_count(&self) {
        self.counters
            .active_lanes
            .store(self.lanes.len() as u64, Ordering::Relaxed);
    }
}

/// Route messages to per-topic lanes until cancelled, then hand off whatever
/// is still buffered and close the lanes.
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    pipeline: Pipeline,
    counters: Arc<Counters>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    // ---
    let (retire_tx, mut retire_rx) = mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher {
        lanes: HashMap::new(),
        pipeline,
        counters,
        tracker,
        retire_tx,
    };
    let mut sweep = tokio::time::interval(LANE_IDLE);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(message) = rx.recv().await {
                    dispatcher.route(message);
                }
                break;
            }
            message = rx.recv() => match message {
                Some(message) => dispatcher.route(message),
                None => break,
            },
            Some(topic) = retire_rx.recv() => dispatcher.retire(&topic),
            _ = sweep.tick() => dispatcher.sweep_idle(),
        }
    }

    // Dropping the senders lets each lane drain and exit
    dispatcher.lanes.clear();
    dispatcher.publish_lane_count();
}

async fn run_lane(
    topic: String,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    pending: Arc<AtomicUsize>,
    pipeline: Pipeline,
    counters: Arc<Counters>,
    retire_tx: mpsc::UnboundedSender<String>,
) {
    // ---
    while let Some(message) = rx.recv().await {
        let resolved = pipeline.process(message, &counters).await;
        pending.fetch_sub(1, Ordering::SeqCst);
        if !resolved {
            // The dispatcher may already be gone during shutdown
            let _ = retire_tx.send(topic.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        actions::AlertHandler,
        batch::BatchConfig,
        catalog::{GrowthPhase, PhaseCatalog},
        error::ActionError,
        rules::{ActionHandler, RuleAction, RuleResult},
        store::MemoryStore,
        transport::MemoryTransport,
    };
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<MemoryTransport>,
        rules: Arc<RuleEngine>,
        coordinator: IngestionCoordinator,
        zone: Uuid,
        device: Uuid,
    }

    async fn create_test_harness(phase: Option<GrowthPhase>) -> Harness {
        // ---
        let store = Arc::new(MemoryStore::new());
        let zone = store.add_zone("main", phase);
        let device = store.add_device("esp01", "tendrill/sensors/esp01/data", Some(zone));

        let catalog = Arc::new(PhaseCatalog::builtin().unwrap());
        let rules = Arc::new(RuleEngine::new(catalog.clone()));
        rules.register_handler(RuleAction::Alert, Arc::new(AlertHandler::new(store.clone())));

        let pipeline = Pipeline {
            store: store.clone(),
            resolver: Arc::new(IdentityResolver::new(store.clone(), "tendrill")),
            batch: Arc::new(BatchWriter::start(
                store.clone(),
                BatchConfig {
                    batch_size: 100,
                    timeout: Duration::from_secs(1),
                },
            )),
            rules: rules.clone(),
            phases: Arc::new(PhaseManager::new(store.clone(), catalog)),
            topic_prefix: "tendrill".to_string(),
        };

        let transport = Arc::new(MemoryTransport::new());
        let coordinator = IngestionCoordinator::new(transport.clone(), pipeline);
        assert_ok!(coordinator.start().await);

        Harness {
            store,
            transport,
            rules,
            coordinator,
            zone,
            device,
        }
    }

    #[tokio::test]
    async fn test_compact_payload_is_stored_and_device_seen() {
        // ---
        let h = create_test_harness(Some(GrowthPhase::Seedling)).await;
        let delivered = h.transport.inject(
            "tendrill/sensors/esp01/data",
            r#"{"d":"esp01","z":"main","r":[["T",24.5],["H",65.2]]}"#,
        );
        assert_eq!(delivered, 1);

        h.coordinator.stop().await;

        let readings = h.store.readings();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.device_id == h.device && r.zone_id == h.zone));
        assert!(h.store.device(h.device).unwrap().last_seen.is_some());

        let stats = h.coordinator.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.readings_queued, 2);
        assert_eq!(stats.malformed, 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_dropped() {
        // ---
        let h = create_test_harness(None).await;
        h.transport.inject("tendrill/sensors/esp01/data", "{not json");
        h.transport.inject(
            "tendrill/sensors/ghost/data",
            r#"{"d":"ghost","z":"main","r":[["T",24.5]]}"#,
        );
        h.transport.inject(
            "tendrill/sensors/esp01/data",
            r#"{"d":"esp01","z":"nowhere","r":[["T",24.5]]}"#,
        );

        h.coordinator.stop().await;

        let stats = h.coordinator.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unresolved, 2);
        assert!(h.store.readings().is_empty());
    }

    #[tokio::test]
    async fn test_phase_target_violation_raises_alert() {
        // ---
        let h = create_test_harness(Some(GrowthPhase::FloweringMid)).await;
        h.transport.inject(
            "tendrill/sensors/esp01/data",
            r#"{"d":"esp01","z":"main","r":[["T",24.0],["H",38.0]]}"#,
        );

        h.coordinator.stop().await;

        let alerts = h.store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message, "Humidity 38% outside phase target (40-50%)");
        assert_eq!(alerts[0].zone_id, Some(h.zone));
        assert_eq!(alerts[0].device_id, Some(h.device));
        assert_eq!(h.coordinator.stats().alerts_dispatched, 1);
    }

    #[tokio::test]
    async fn test_messages_per_device_keep_order() {
        // ---
        let h = create_test_harness(None).await;
        for i in 0..20 {
            let payload = format!(r#"{{"d":"esp01","z":"main","t":{},"r":[["T",{i}.0]]}}"#, 1_700_000_000 + i);
            h.transport.inject("tendrill/sensors/esp01/data", payload);
        }

        h.coordinator.stop().await;

        let values: Vec<f64> = h.store.readings().iter().map(|r| r.value).collect();
        assert_eq!(values, (0..20).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        // ---
        let h = create_test_harness(None).await;
        assert_eq!(h.transport.subscription_count(), 1);

        h.coordinator.stop().await;

        assert_eq!(h.transport.subscription_count(), 0);
        assert_eq!(h.transport.inject("tendrill/sensors/esp01/data", "{}"), 0);
    }

    /// Handler that takes 30 seconds per result.
    struct Slow(AtomicUsize);

    #[async_trait]
    impl ActionHandler for Slow {
        async fn handle(&self, _: &ActionContext, _: &RuleResult) -> Result<(), ActionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_does_not_hold_up_the_lane() {
        // ---
        let h = create_test_harness(None).await;
        let slow = Arc::new(Slow(AtomicUsize::new(0)));
        h.rules.register_handler(RuleAction::Alert, slow.clone());

        h.transport
            .inject("tendrill/sensors/esp01/data", r#"{"d":"esp01","z":"main","r":[["T",40.0]]}"#);
        h.transport
            .inject("tendrill/sensors/esp01/data", r#"{"d":"esp01","z":"main","r":[["T",22.0]]}"#);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.coordinator.stats().readings_queued, 2);
        assert_eq!(slow.0.load(Ordering::SeqCst), 0);

        // Stop waits for the handlers still running
        h.coordinator.stop().await;
        assert_eq!(slow.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_topics_do_not_keep_lanes() {
        // ---
        let h = create_test_harness(None).await;
        for i in 0..500 {
            let payload = format!(r#"{{"d":"ghost{i}","z":"main","r":[["T",20.0]]}}"#);
            h.transport
                .inject(&format!("tendrill/sensors/ghost{i}/data"), payload);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = h.coordinator.stats();
        assert_eq!(stats.unresolved, 500);
        assert_eq!(stats.active_lanes, 0);
        h.coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lanes_are_closed_and_reopened() {
        // ---
        let h = create_test_harness(None).await;
        let payload = r#"{"d":"esp01","z":"main","r":[["T",22.0]]}"#;

        h.transport.inject("tendrill/sensors/esp01/data", payload);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.coordinator.stats().active_lanes, 1);

        tokio::time::sleep(LANE_IDLE * 2).await;
        assert_eq!(h.coordinator.stats().active_lanes, 0);

        h.transport.inject("tendrill/sensors/esp01/data", payload);
        h.coordinator.stop().await;

        assert_eq!(h.coordinator.stats().readings_queued, 2);
        assert_eq!(h.store.readings().len(), 2);
    }
}
