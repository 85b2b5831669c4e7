//! Persistence boundary consumed by the ingestion core.
//!
//! The core only ever talks to the `Store` trait. Each call either fully
//! succeeds or fully fails; absence is reported as `Ok(None)`.
//!
//! Implementations:
//! - [`PgStore`]: PostgreSQL via `sqlx`, used in production.
//! - [`MemoryStore`]: in-process maps, used when no database is configured
//!   and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{catalog::GrowthPhase, error::StoreError, models::Reading, rules::Severity};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// A physical grow space.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Zone {
    // ---
    pub id: Uuid,
    pub name: String,
    pub current_phase: Option<String>,
    pub phase_started: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// A sensor or actuator device, registered under its data topic.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Device {
    // ---
    pub id: Uuid,
    pub name: String,
    pub zone_id: Option<Uuid>,
    pub mqtt_topic: String,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One cultivation cycle inside a zone.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Grow {
    // ---
    pub id: Uuid,
    pub zone_id: Uuid,
    pub name: String,
    pub strain: Option<String>,
    pub current_phase: String,
    pub phase_started: DateTime<Utc>,
    pub grow_started: DateTime<Utc>,
    pub is_active: bool,
}

/// One interval of a grow's phase history. Exactly one interval per grow
/// has `ended_at == None`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PhaseInterval {
    // ---
    pub grow_id: Uuid,
    pub phase: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Alert to persist, derived from a triggered rule result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAlert {
    // ---
    pub alert_type: String,
    pub message: String,
    pub severity: Severity,
    pub zone_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub sensor_type: Option<String>,
    pub value: Option<f64>,
    pub threshold_min: Option<f64>,
    pub threshold_max: Option<f64>,
}

// ---

#[async_trait]
pub trait Store: Send + Sync {
    // ---
    async fn get_zone(&self, id: Uuid) -> Result<Option<Zone>, StoreError>;

    async fn list_active_zones(&self) -> Result<Vec<Zone>, StoreError>;

    async fn update_zone_phase(&self, id: Uuid, phase: GrowthPhase) -> Result<(), StoreError>;

    /// Look a device up by the data topic it publishes on.
    async fn get_device_by_topic(&self, topic: &str) -> Result<Option<Device>, StoreError>;

    async fn update_device_last_seen(
        &self,
        id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_grow(&self, id: Uuid) -> Result<Option<Grow>, StoreError>;

    /// Active grows, optionally restricted to one zone.
    async fn list_active_grows(&self, zone_id: Option<Uuid>) -> Result<Vec<Grow>, StoreError>;

    /// Close the open phase interval, set the new phase and open a new
    /// interval, as one unit.
    async fn update_grow_phase(
        &self,
        id: Uuid,
        phase: GrowthPhase,
        notes: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn phase_history(&self, grow_id: Uuid) -> Result<Vec<PhaseInterval>, StoreError>;

    /// Insert a batch of readings, returning the number written.
    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64, StoreError>;

    async fn create_alert(&self, alert: &NewAlert) -> Result<Uuid, StoreError>;
}
