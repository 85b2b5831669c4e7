//! In-process store.
//!
//! Backs the service when no `DATABASE_URL` is configured and gives tests a
//! store they can seed and inspect. All state sits behind one mutex, so every
//! call is atomic with respect to every other.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Device, Grow, NewAlert, PhaseInterval, Store, Zone};
use crate::{catalog::GrowthPhase, error::StoreError, models::Reading};

#[derive(Default)]
struct Inner {
    zones: HashMap<Uuid, Zone>,
    devices: HashMap<Uuid, Device>,
    grows: HashMap<Uuid, Grow>,
    history: Vec<PhaseInterval>,
    readings: Vec<Reading>,
    batches: Vec<usize>,
    alerts: Vec<(Uuid, NewAlert)>,
}

#[derive(Default)]
pub struct MemoryStore {
    // ---
    inner: Mutex<Inner>,
    fail_inserts: AtomicBool,
    device_lookups: AtomicUsize,
    zone_lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- seeding

    pub fn add_zone(&self, name: &str, phase: Option<GrowthPhase>) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        let zone = Zone {
            id,
            name: name.to_string(),
            current_phase: phase.map(|p| p.to_string()),
            phase_started: phase.map(|_| Utc::now()),
            is_active: true,
        };
        self.inner().zones.insert(id, zone);
        id
    }

    pub fn add_device(&self, name: &str, topic: &str, zone_id: Option<Uuid>) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        let device = Device {
            id,
            name: name.to_string(),
            zone_id,
            mqtt_topic: topic.to_string(),
            is_active: true,
            last_seen: None,
        };
        self.inner().devices.insert(id, device);
        id
    }

    /// Register an active grow that entered `phase` at `phase_started`.
    pub fn add_grow(
        &self,
        zone_id: Uuid,
        name: &str,
        phase: GrowthPhase,
        phase_started: DateTime<Utc>,
        grow_started: DateTime<Utc>,
    ) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        let mut inner = self.inner();
        inner.grows.insert(
            id,
            Grow {
                id,
                zone_id,
                name: name.to_string(),
                strain: None,
                current_phase: phase.to_string(),
                phase_started,
                grow_started,
                is_active: true,
            },
        );
        inner.history.push(PhaseInterval {
            grow_id: id,
            phase: phase.to_string(),
            started_at: phase_started,
            ended_at: None,
            notes: None,
        });
        id
    }

    /// Move a grow's phase start without recording a transition.
    pub fn set_grow_phase_started(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(grow) = self.inner().grows.get_mut(&id) {
            grow.phase_started = at;
        }
    }

    pub fn deactivate_grow(&self, id: Uuid) {
        if let Some(grow) = self.inner().grows.get_mut(&id) {
            grow.is_active = false;
        }
    }

    pub fn rename_zone(&self, id: Uuid, name: &str) {
        if let Some(zone) = self.inner().zones.get_mut(&id) {
            zone.name = name.to_string();
        }
    }

    /// Make every subsequent `insert_readings` call fail.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    // --- inspection

    pub fn readings(&self) -> Vec<Reading> {
        self.inner().readings.clone()
    }

    /// Sizes of the successful `insert_readings` calls, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner().batches.clone()
    }

    pub fn alerts(&self) -> Vec<NewAlert> {
        self.inner().alerts.iter().map(|(_, a)| a.clone()).collect()
    }

    pub fn device(&self, id: Uuid) -> Option<Device> {
        self.inner().devices.get(&id).cloned()
    }

    pub fn device_lookups(&self) -> usize {
        self.device_lookups.load(Ordering::SeqCst)
    }

    pub fn zone_lookups(&self) -> usize {
        self.zone_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ---
    async fn get_zone(&self, id: Uuid) -> Result<Option<Zone>, StoreError> {
        Ok(self.inner().zones.get(&id).cloned())
    }

    async fn list_active_zones(&self) -> Result<Vec<Zone>, StoreError> {
        // ---
        self.zone_lookups.fetch_add(1, Ordering::SeqCst);
        let mut zones: Vec<Zone> = self
            .inner()
            .zones
            .values()
            .filter(|z| z.is_active)
            .cloned()
            .collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(zones)
    }

    async fn update_zone_phase(&self, id: Uuid, phase: GrowthPhase) -> Result<(), StoreError> {
        // ---
        let mut inner = self.inner();
        let zone = inner
            .zones
            .get_mut(&id)
            .ok_or_else(|| StoreError::Corrupt(format!("zone {id} vanished")))?;
        zone.current_phase = Some(phase.to_string());
        zone.phase_started = Some(Utc::now());
        Ok(())
    }

    async fn get_device_by_topic(&self, topic: &str) -> Result<Option<Device>, StoreError> {
        // ---
        self.device_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner()
            .devices
            .values()
            .find(|d| d.mqtt_topic == topic)
            .cloned())
    }

    async fn update_device_last_seen(
        &self,
        id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(device) = self.inner().devices.get_mut(&id) {
            device.last_seen = Some(seen_at);
        }
        Ok(())
    }

    async fn get_grow(&self, id: Uuid) -> Result<Option<Grow>, StoreError> {
        Ok(self.inner().grows.get(&id).cloned())
    }

    async fn list_active_grows(&self, zone_id: Option<Uuid>) -> Result<Vec<Grow>, StoreError> {
        // ---
        let mut grows: Vec<Grow> = self
            .inner()
            .grows
            .values()
            .filter(|g| g.is_active && zone_id.map_or(true, |z| g.zone_id == z))
            .cloned()
            .collect();
        grows.sort_by_key(|g| g.grow_started);
        Ok(grows)
    }

    async fn update_grow_phase(
        &self,
        id: Uuid,
        phase: GrowthPhase,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        // ---
        let now = Utc::now();
        let mut inner = self.inner();
        let grow = inner
            .grows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Corrupt(format!("grow {id} vanished")))?;
        grow.current_phase = phase.to_string();
        grow.phase_started = now;

        for interval in inner
            .history
            .iter_mut()
            .filter(|h| h.grow_id == id && h.ended_at.is_none())
        {
            interval.ended_at = Some(now);
        }
        inner.history.push(PhaseInterval {
            grow_id: id,
            phase: phase.to_string(),
            started_at: now,
            ended_at: None,
            notes: notes.map(str::to_string),
        });
        Ok(())
    }

    async fn phase_history(&self, grow_id: Uuid) -> Result<Vec<PhaseInterval>, StoreError> {
        Ok(self
            .inner()
            .history
            .iter()
            .filter(|h| h.grow_id == grow_id)
            .cloned()
            .collect())
    }

    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64, StoreError> {
        // ---
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert rejected".to_string()));
        }
        let mut inner = self.inner();
        inner.readings.extend_from_slice(readings);
        inner.batches.push(readings.len());
        Ok(readings.len() as u64)
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.inner().alerts.push((id, alert.clone()));
        Ok(id)
    }
}
