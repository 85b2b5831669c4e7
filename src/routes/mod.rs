//! HTTP surface of the service.
//!
//! Each sibling module exports a subrouter; this gateway merges them and
//! attaches the shared state so `main.rs` never sees individual endpoints.

use std::sync::Arc;

use axum::Router;

use crate::{batch::BatchWriter, ingestion::IngestionCoordinator, scheduler::Scheduler};

mod health;
mod status;

// ---

/// Components the status endpoints report on.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionCoordinator>,
    pub batch: Arc<BatchWriter>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(status::router())
        .merge(health::router())
        .with_state(state)
}
