//! Database schema management for `tendrill-core`.
//!
//! Ensures the tables the ingestion core reads and writes exist before the
//! coordinator starts. Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create the schema if it does not exist (idempotent).
///
/// Zones, devices and grows are owned by the surrounding application; they
/// are created here only so a fresh database is usable. Readings, alerts and
/// phase history are written by this crate.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS zones (
            id             UUID PRIMARY KEY,
            name           TEXT        NOT NULL,
            current_phase  TEXT,
            phase_started  TIMESTAMPTZ,
            is_active      BOOLEAN     NOT NULL DEFAULT TRUE,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id          UUID PRIMARY KEY,
            name        TEXT        NOT NULL,
            zone_id     UUID REFERENCES zones (id),
            mqtt_topic  TEXT        NOT NULL UNIQUE,
            is_active   BOOLEAN     NOT NULL DEFAULT TRUE,
            last_seen   TIMESTAMPTZ,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS grows (
            id             UUID PRIMARY KEY,
            zone_id        UUID        NOT NULL REFERENCES zones (id),
            name           TEXT        NOT NULL,
            strain         TEXT,
            current_phase  TEXT        NOT NULL DEFAULT 'germination',
            phase_started  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            grow_started   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            is_active      BOOLEAN     NOT NULL DEFAULT TRUE,
            updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS phase_history (
            id          UUID PRIMARY KEY,
            grow_id     UUID        NOT NULL REFERENCES grows (id),
            phase       TEXT        NOT NULL,
            started_at  TIMESTAMPTZ NOT NULL,
            ended_at    TIMESTAMPTZ,
            notes       TEXT
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            time         TIMESTAMPTZ      NOT NULL,
            device_id    UUID             NOT NULL,
            zone_id      UUID             NOT NULL,
            sensor_type  TEXT             NOT NULL,
            value        DOUBLE PRECISION NOT NULL,
            unit         TEXT             NOT NULL,
            quality      SMALLINT         NOT NULL DEFAULT 100
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id             UUID PRIMARY KEY,
            alert_type     TEXT        NOT NULL,
            message        TEXT        NOT NULL,
            severity       TEXT        NOT NULL,
            zone_id        UUID,
            device_id      UUID,
            sensor_type    TEXT,
            value          DOUBLE PRECISION,
            threshold_min  DOUBLE PRECISION,
            threshold_max  DOUBLE PRECISION,
            acknowledged   BOOLEAN     NOT NULL DEFAULT FALSE,
            resolved       BOOLEAN     NOT NULL DEFAULT FALSE,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
        // One open phase interval per grow
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_phase_history_open
            ON phase_history (grow_id) WHERE ended_at IS NULL;
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_zone_time
            ON sensor_readings (zone_id, time DESC);
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_zone
            ON alerts (zone_id, created_at DESC);
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}
