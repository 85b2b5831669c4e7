//! Core of the Tendrill grow-zone backend.
//!
//! Sensor nodes publish readings over MQTT. The ingestion coordinator decodes
//! them, resolves device and zone identities, hands readings to the batch
//! writer and checks them against the zone's growth-phase targets and the
//! absolute alert rules. The phase manager tracks grows through the phase
//! sequence, and the scheduler runs the periodic reviews.
//!
//! Module boundaries:
//! - `catalog`: growth phases and their environment targets
//! - `models`: payload decoding and the stored reading shape
//! - `store`: persistence trait with Postgres and in-memory implementations
//! - `transport`: publish/subscribe trait with MQTT and in-memory implementations
//! - `resolver`, `batch`, `rules`, `actions`, `phases`, `scheduler`, `ingestion`:
//!   the processing components
//! - `routes`: the HTTP surface

pub mod actions;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod models;
pub mod phases;
pub mod resolver;
pub mod routes;
pub mod rules;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod transport;

pub use config::Config;
pub use ingestion::{IngestionCoordinator, IngestionStats, Pipeline};
