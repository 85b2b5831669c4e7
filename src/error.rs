//! Typed errors for the ingestion core.
//!
//! Each component returns its own error enum so callers can decide what is
//! fatal. Absence ("device not registered", "no active grows") is expressed
//! with `Option`, never with one of these variants.

use thiserror::Error;
use uuid::Uuid;

use crate::catalog::GrowthPhase;

// ---

/// Failures from the persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures from the publish/subscribe transport.
#[derive(Debug, Error)]
pub enum TransportError {
    // ---
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport closed")]
    Closed,
}

/// Inbound sensor payloads that cannot be decoded or fail validation.
#[derive(Debug, Error)]
pub enum PayloadError {
    // ---
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("invalid field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Phase catalog loading and validation failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    // ---
    #[error("cannot read catalog file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("catalog has no definition for phase '{0}'")]
    MissingPhase(GrowthPhase),

    #[error("catalog range '{field}' of phase '{phase}' has low > high")]
    InvertedRange { phase: GrowthPhase, field: &'static str },
}

/// Phase transition failures. Each variant carries a human-readable reason.
#[derive(Debug, Error)]
pub enum PhaseError {
    // ---
    #[error("grow {0} not found")]
    GrowNotFound(Uuid),

    #[error("grow {0} is not active")]
    GrowInactive(Uuid),

    #[error("zone {0} not found")]
    ZoneNotFound(Uuid),

    #[error("unknown growth phase '{0}'")]
    UnknownPhase(String),

    #[error("no phase follows {0}")]
    NoNextPhase(GrowthPhase),

    #[error("minimum duration not reached ({days}/{min_days} days in {phase})")]
    MinimumDurationNotMet {
        phase: GrowthPhase,
        days: i64,
        min_days: u32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures raised by an action handler while dispatching a rule result.
#[derive(Debug, Error)]
pub enum ActionError {
    // ---
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("webhook request failed: {0}")]
    Webhook(#[from] reqwest::Error),

    #[error("webhook rejected: {0}")]
    WebhookRejected(String),

    #[error("missing action parameter '{0}'")]
    MissingParam(&'static str),
}

/// Batch writer errors visible to producers.
#[derive(Debug, Error)]
pub enum BatchError {
    // ---
    #[error("batch writer is stopped")]
    Stopped,
}
