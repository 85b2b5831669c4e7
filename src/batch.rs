//! Batch writer: coalesces readings into multi-row store inserts.
//!
//! Producers push into an unbounded channel and never wait on the store. One
//! background task owns the receiving end and the in-flight batch, so no two
//! flushes can touch the same buffer. The loop waits up to `timeout` for a
//! first reading, drains whatever else is already queued (at most
//! `batch_size` in total) without waiting, and writes the batch. On stop the
//! queue is closed and drained in full.

use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{error::BatchError, models::Reading, store::Store};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct BatchCounters {
    enqueued: AtomicU64,
    flushes: AtomicU64,
    written: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of the writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub enqueued: u64,
    pub flushes: u64,
    pub written: u64,
    /// Readings lost to failed store writes.
    pub discarded: u64,
}

pub struct BatchWriter {
    // ---
    tx: mpsc::UnboundedSender<Reading>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<BatchCounters>,
}

impl BatchWriter {
    /// Spawn the flush loop.
    pub fn start(store: Arc<dyn Store>, config: BatchConfig) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let counters = Arc::new(BatchCounters::default());
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };

        let task = tokio::spawn(run(rx, store, config, shutdown.clone(), counters.clone()));
        info!(
            batch_size = config.batch_size,
            timeout_ms = config.timeout.as_millis() as u64,
            "Batch writer started"
        );

        Self {
            tx,
            shutdown,
            task: Mutex::new(Some(task)),
            counters,
        }
    }

    /// Queue one reading. Fails only once the writer has stopped.
    pub fn enqueue(&self, reading: Reading) -> Result<(), BatchError> {
        // ---
        self.tx.send(reading).map_err(|_| BatchError::Stopped)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the loop, flushing everything still queued before returning.
    pub async fn stop(&self) {
        // ---
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "Batch writer task failed");
            }
            let stats = self.stats();
            info!(written = stats.written, discarded = stats.discarded, "Batch writer stopped");
        }
    }

    pub fn stats(&self) -> BatchStats {
        // ---
        let c = &self.counters;
        BatchStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Reading>,
    store: Arc<dyn Store>,
    config: BatchConfig,
    shutdown: CancellationToken,
    counters: Arc<BatchCounters>,
) {
    // ---
    let mut batch: Vec<Reading> = Vec::with_capacity(config.batch_size);

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            first = timeout_at(Instant::now() + config.timeout, rx.recv()) => first,
        };
        match first {
            Ok(Some(reading)) => batch.push(reading),
            Ok(None) => break,
            Err(_) => continue,
        }

        // Take whatever else is already queued, without waiting
        while batch.len() < config.batch_size {
            match rx.try_recv() {
                Ok(reading) => batch.push(reading),
                Err(_) => break,
            }
        }
        flush(&*store, &mut batch, &counters).await;
    }

    // Refuse new readings, then write out whatever is still queued
    rx.close();
    while let Some(reading) = rx.recv().await {
        batch.push(reading);
        if batch.len() >= config.batch_size {
            flush(&*store, &mut batch, &counters).await;
        }
    }
    flush(&*store, &mut batch, &counters).await;
}

/// Write and reset the batch. A failed write discards the batch.
async fn flush(store: &dyn Store, batch: &mut Vec<Reading>, counters: &BatchCounters) {
    // ---
    if batch.is_empty() {
        return;
    }
    let readings = mem::take(batch);
    let count = readings.len() as u64;

    match store.insert_readings(&readings).await {
        Ok(written) => {
            counters.flushes.fetch_add(1, Ordering::Relaxed);
            counters.written.fetch_add(written, Ordering::Relaxed);
            debug!(count = written, "Flushed readings");
        }
        Err(err) => {
            counters.discarded.fetch_add(count, Ordering::Relaxed);
            error!(count, error = %err, "Failed to write readings, batch discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{models::SensorKind, store::MemoryStore};
    use chrono::Utc;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    fn create_test_reading(value: f64) -> Reading {
        Reading {
            time: Utc::now(),
            device_id: Uuid::nil(),
            zone_id: Uuid::nil(),
            kind: SensorKind::Temperature,
            value,
            unit: "°C".to_string(),
            quality: 100,
        }
    }

    fn create_test_writer(batch_size: usize, timeout: Duration) -> (Arc<MemoryStore>, BatchWriter) {
        let store = Arc::new(MemoryStore::new());
        let writer = BatchWriter::start(store.clone(), BatchConfig { batch_size, timeout });
        (store, writer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_without_waiting_for_timeout() {
        // ---
        let (store, writer) = create_test_writer(100, Duration::from_secs(1));
        for i in 0..3 {
            assert_ok!(writer.enqueue(create_test_reading(i as f64)));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.batch_sizes(), vec![3]);

        let values: Vec<f64> = store.readings().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_is_split_at_batch_size() {
        // ---
        let (store, writer) = create_test_writer(100, Duration::from_secs(1));
        for i in 0..250 {
            assert_ok!(writer.enqueue(create_test_reading(i as f64)));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.batch_sizes(), vec![100, 100, 50]);
        assert_eq!(writer.stats().flushes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_writer_keeps_waiting() {
        // ---
        let (store, writer) = create_test_writer(100, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.batch_sizes().is_empty());

        assert_ok!(writer.enqueue(create_test_reading(1.0)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.batch_sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_without_timeout() {
        // ---
        let (store, writer) = create_test_writer(10, Duration::from_secs(3600));
        for i in 0..10 {
            assert_ok!(writer.enqueue(create_test_reading(i as f64)));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.batch_sizes(), vec![10]);
        assert_eq!(writer.stats().flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_queued_readings() {
        // ---
        let (store, writer) = create_test_writer(100, Duration::from_secs(3600));
        for i in 0..250 {
            assert_ok!(writer.enqueue(create_test_reading(i as f64)));
        }

        writer.stop().await;

        assert_eq!(store.readings().len(), 250);
        assert!(store.batch_sizes().iter().all(|n| *n <= 100));
        assert_eq!(writer.stats().written, 250);
        assert!(matches!(
            writer.enqueue(create_test_reading(0.0)),
            Err(BatchError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_discards_and_continues() {
        // ---
        let (store, writer) = create_test_writer(100, Duration::from_millis(100));
        store.fail_inserts(true);
        for i in 0..3 {
            assert_ok!(writer.enqueue(create_test_reading(i as f64)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(writer.stats().discarded, 3);

        store.fail_inserts(false);
        assert_ok!(writer.enqueue(create_test_reading(9.0)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.readings().len(), 1);
        assert_eq!(writer.stats().written, 1);
    }
}
