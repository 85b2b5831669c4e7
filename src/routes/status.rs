use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tracing::debug;

use super::AppState;
use crate::{batch::BatchStats, ingestion::IngestionStats, scheduler::TaskStatus};

// ---

#[derive(Debug, Serialize)]
struct StatusResponse {
    ingestion: IngestionStats,
    batch_writer: BatchStats,
    tasks: Vec<TaskStatus>,
}

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/status", get(handler))
}

/// Handle `GET /status`: pipeline counters and scheduled task state.
async fn handler(State(state): State<AppState>) -> Json<StatusResponse> {
    // ---
    debug!("GET /status");
    Json(snapshot(&state))
}

fn snapshot(state: &AppState) -> StatusResponse {
    StatusResponse {
        ingestion: state.ingestion.stats(),
        batch_writer: state.batch.stats(),
        tasks: state.scheduler.all_tasks(),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        batch::{BatchConfig, BatchWriter},
        catalog::PhaseCatalog,
        ingestion::{IngestionCoordinator, Pipeline},
        phases::PhaseManager,
        resolver::IdentityResolver,
        rules::RuleEngine,
        scheduler::Scheduler,
        store::MemoryStore,
        transport::MemoryTransport,
    };
    use std::{sync::Arc, time::Duration};

    fn create_test_state() -> AppState {
        // ---
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(PhaseCatalog::builtin().unwrap());
        let batch = Arc::new(BatchWriter::start(store.clone(), BatchConfig::default()));
        let pipeline = Pipeline {
            store: store.clone(),
            resolver: Arc::new(IdentityResolver::new(store.clone(), "tendrill")),
            batch: batch.clone(),
            rules: Arc::new(RuleEngine::new(catalog.clone())),
            phases: Arc::new(PhaseManager::new(store, catalog)),
            topic_prefix: "tendrill".to_string(),
        };
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(1)));
        scheduler.add_interval("phase_review", Duration::from_secs(3600), || async { Ok(()) });

        AppState {
            ingestion: Arc::new(IngestionCoordinator::new(
                Arc::new(MemoryTransport::new()),
                pipeline,
            )),
            batch,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_status_serializes_all_sections() {
        // ---
        let state = create_test_state();
        let Json(body) = handler(State(state)).await;
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["ingestion"]["received"], 0);
        assert_eq!(value["batch_writer"]["written"], 0);
        assert_eq!(value["tasks"][0]["name"], "phase_review");
        assert_eq!(value["tasks"][0]["enabled"], true);
    }
}
