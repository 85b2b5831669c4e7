//! Application entry point for the `tendrill` backend service.
//!
//! Startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Load the growth-phase catalog
//! - Connect the store (Postgres when `DATABASE_URL` is set, otherwise
//!   in-memory) and create the schema
//! - Connect to the MQTT broker and start sensor ingestion
//! - Schedule the phase review and daily phase report
//! - Serve the status routes until Ctrl-C, then shut down in order
//!
//! # Environment Variables
//! See `config::load_from_env` for the full list. Logging is controlled by:
//! - `TENDRILL_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `TENDRILL_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use tendrill_core::{
    actions::{ActuatorHandler, AlertHandler, LogHandler, WebhookHandler},
    batch::{BatchConfig, BatchWriter},
    catalog::PhaseCatalog,
    config,
    phases::PhaseManager,
    resolver::IdentityResolver,
    routes::{self, AppState},
    rules::{RuleAction, RuleEngine},
    scheduler::Scheduler,
    schema,
    store::{MemoryStore, PgStore, Store},
    transport::{MqttTransport, Transport},
    Config, IngestionCoordinator, Pipeline,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let catalog = Arc::new(
        PhaseCatalog::load(cfg.catalog_path.as_deref()).context("Failed to load phase catalog")?,
    );
    let store = connect_store(&cfg).await?;

    let mqtt = Arc::new(MqttTransport::connect(&cfg.mqtt));
    let transport: Arc<dyn Transport> = mqtt.clone();
    let prefix = cfg.mqtt.topic_prefix.clone();

    let rules = Arc::new(RuleEngine::new(catalog.clone()));
    rules.register_handler(RuleAction::Alert, Arc::new(AlertHandler::new(store.clone())));
    rules.register_handler(RuleAction::Log, Arc::new(LogHandler));
    rules.register_handler(
        RuleAction::Actuator,
        Arc::new(ActuatorHandler::new(transport.clone(), prefix.clone())),
    );
    if let Some(url) = cfg.webhook_url.as_deref() {
        let webhook = WebhookHandler::new(url).context("Invalid WEBHOOK_URL")?;
        tracing::info!("Webhook actions enabled: {}", webhook.redacted_target());
        rules.register_handler(RuleAction::Webhook, Arc::new(webhook));
    }

    let phases = Arc::new(PhaseManager::new(store.clone(), catalog.clone()));
    let batch = Arc::new(BatchWriter::start(
        store.clone(),
        BatchConfig {
            batch_size: cfg.batch_size,
            timeout: cfg.batch_timeout,
        },
    ));

    let ingestion = Arc::new(IngestionCoordinator::new(
        transport.clone(),
        Pipeline {
            store: store.clone(),
            resolver: Arc::new(IdentityResolver::new(store.clone(), prefix.clone())),
            batch: batch.clone(),
            rules,
            phases: phases.clone(),
            topic_prefix: prefix,
        },
    ));
    ingestion
        .start()
        .await
        .context("Failed to subscribe to sensor data")?;

    let scheduler = Arc::new(Scheduler::new(cfg.scheduler_tick));
    schedule_phase_tasks(&scheduler, &phases, &cfg);
    scheduler.start();

    // Build app from routes gateway
    let app = routes::router(AppState {
        ingestion: ingestion.clone(),
        batch,
        scheduler: scheduler.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    ingestion.stop().await;
    scheduler.stop().await;
    mqtt.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

// ---

async fn connect_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    // ---
    let Some(db_url) = cfg.db_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };

    tracing::info!("Attempting to connect to database");
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(db_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

fn schedule_phase_tasks(scheduler: &Scheduler, phases: &Arc<PhaseManager>, cfg: &Config) {
    // ---
    let review = phases.clone();
    scheduler.add_interval("phase_review", cfg.phase_review_interval, move || {
        let phases = review.clone();
        async move {
            phases.review_active_grows().await?;
            Ok::<(), anyhow::Error>(())
        }
    });

    let report = phases.clone();
    scheduler.add_daily("daily_phase_report", cfg.phase_report_at, move || {
        let phases = report.clone();
        async move {
            for entry in phases.phase_summary().await? {
                if entry.active_grows > 0 {
                    tracing::info!(
                        phase = %entry.phase,
                        grows = entry.active_grows,
                        names = ?entry.grow_names,
                        "Daily phase report"
                    );
                }
            }
            Ok::<(), anyhow::Error>(())
        }
    });
}

async fn shutdown_signal() {
    // ---
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output: `FORCE_COLOR=1|true|yes` forces it on,
///   `FORCE_COLOR=0|false|no` forces it off, otherwise TTY detection
/// - Span events from `TENDRILL_SPAN_EVENTS`: `"full"`, `"enter_exit"`,
///   anything else emits CLOSE only
/// - Level from `RUST_LOG` when set, otherwise `TENDRILL_LOG_LEVEL`
///
/// Call once at startup, before any logging macro.
fn init_tracing() {
    // ---
    let span_events = match env::var("TENDRILL_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("TENDRILL_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,rumqttc=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
