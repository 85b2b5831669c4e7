//! PostgreSQL store backed by a `sqlx` connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{Device, Grow, NewAlert, PhaseInterval, Store, Zone};
use crate::{catalog::GrowthPhase, error::StoreError, models::Reading};

/// Postgres caps bind parameters per statement; 7 columns per reading.
const MAX_ROWS_PER_INSERT: usize = 5_000;

// ---

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    // ---
    async fn get_zone(&self, id: Uuid) -> Result<Option<Zone>, StoreError> {
        // ---
        let zone = sqlx::query_as::<_, Zone>(
            r#"
            SELECT id, name, current_phase, phase_started, is_active
            FROM zones WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(zone)
    }

    async fn list_active_zones(&self) -> Result<Vec<Zone>, StoreError> {
        // ---
        let zones = sqlx::query_as::<_, Zone>(
            r#"
            SELECT id, name, current_phase, phase_started, is_active
            FROM zones WHERE is_active = TRUE
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(zones)
    }

    async fn update_zone_phase(&self, id: Uuid, phase: GrowthPhase) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            UPDATE zones
            SET current_phase = $2, phase_started = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(phase.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_device_by_topic(&self, topic: &str) -> Result<Option<Device>, StoreError> {
        // ---
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, name, zone_id, mqtt_topic, is_active, last_seen
            FROM devices WHERE mqtt_topic = $1
            "#,
        )
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn update_device_last_seen(
        &self,
        id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // ---
        sqlx::query("UPDATE devices SET last_seen = $2 WHERE id = $1")
            .bind(id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_grow(&self, id: Uuid) -> Result<Option<Grow>, StoreError> {
        // ---
        let grow = sqlx::query_as::<_, Grow>(
            r#"
            SELECT id, zone_id, name, strain, current_phase, phase_started,
                   grow_started, is_active
            FROM grows WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(grow)
    }

    async fn list_active_grows(&self, zone_id: Option<Uuid>) -> Result<Vec<Grow>, StoreError> {
        // ---
        let grows = sqlx::query_as::<_, Grow>(
            r#"
            SELECT id, zone_id, name, strain, current_phase, phase_started,
                   grow_started, is_active
            FROM grows
            WHERE is_active = TRUE AND ($1::uuid IS NULL OR zone_id = $1)
            ORDER BY grow_started
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(grows)
    }

    async fn update_grow_phase(
        &self,
        id: Uuid,
        phase: GrowthPhase,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE phase_history SET ended_at = NOW()
            WHERE grow_id = $1 AND ended_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE grows
            SET current_phase = $2, phase_started = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(phase.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO phase_history (id, grow_id, phase, started_at, notes)
            VALUES ($1, $2, $3, NOW(), $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(phase.as_str())
        .bind(notes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn phase_history(&self, grow_id: Uuid) -> Result<Vec<PhaseInterval>, StoreError> {
        // ---
        let history = sqlx::query_as::<_, PhaseInterval>(
            r#"
            SELECT grow_id, phase, started_at, ended_at, notes
            FROM phase_history WHERE grow_id = $1
            ORDER BY started_at
            "#,
        )
        .bind(grow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }

    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64, StoreError> {
        // ---
        if readings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for chunk in readings.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensor_readings (time, device_id, zone_id, sensor_type, value, unit, quality) ",
            );
            builder.push_values(chunk, |mut row, r| {
                row.push_bind(r.time)
                    .push_bind(r.device_id)
                    .push_bind(r.zone_id)
                    .push_bind(r.kind.as_str().to_string())
                    .push_bind(r.value)
                    .push_bind(r.unit.clone())
                    .push_bind(i16::from(r.quality));
            });
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<Uuid, StoreError> {
        // ---
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, alert_type, message, severity, zone_id, device_id,
                sensor_type, value, threshold_min, threshold_max
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(alert.severity.as_str())
        .bind(alert.zone_id)
        .bind(alert.device_id)
        .bind(&alert.sensor_type)
        .bind(alert.value)
        .bind(alert.threshold_min)
        .bind(alert.threshold_max)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}
