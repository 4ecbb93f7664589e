/**
 * SMOKEWATCH KERNEL - Point d'entrée du service d'ingestion
 *
 * RÔLE : Orchestration : config, store, notifications, pipeline, abonnement MQTT, API HTTP.
 * DÉMARRAGE : .env → logs → config → store → sender → pipeline → start (avec backoff) → HTTP.
 * ARRÊT : Ctrl-C → arrêt du serveur HTTP → stop() du manager (attend le message en cours).
 *
 * MODE COLLECTE : --collect-for <secs> ingère pendant une fenêtre fixe, affiche
 * un résumé puis s'arrête, sans serveur HTTP.
 */

use anyhow::{Context, Result};
use clap::Parser;
use smokewatch_kernel::config::{load_config, AppConfig};
use smokewatch_kernel::health::HealthTracker;
use smokewatch_kernel::http::{self, AppState};
use smokewatch_kernel::models::ReadingKind;
use smokewatch_kernel::mqtt::RumqttConnector;
use smokewatch_kernel::notify::build_sender;
use smokewatch_kernel::pipeline::IngestPipeline;
use smokewatch_kernel::ports::{open_store, SharedStore};
use smokewatch_kernel::recipients::RecipientRegistry;
use smokewatch_kernel::subscription::{DispatchSettings, SubscriptionManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "smokewatch-kernel", version, about = "MQTT ingestion for temperature and smoke sensors")]
struct Cli {
    /// Fichier de configuration YAML
    #[arg(short, long, env = "SMOKEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Ingère pendant N secondes puis s'arrête (pas de serveur HTTP)
    #[arg(long, value_name = "SECS")]
    collect_for: Option<u64>,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.as_deref()).await.context("loading configuration")?;
    cfg.validate().context("validating configuration")?;

    let health = HealthTracker::new();
    let store = open_store(&cfg.store).context("opening reading store")?;
    let recipients = RecipientRegistry::from_emails(&cfg.alerts.recipients);
    let sender = Arc::new(build_sender(&cfg).context("building notification transport")?);
    info!(
        store = %store.info().backend,
        transport = sender.transport_name(),
        recipients = recipients.list().len(),
        "ingestion pipeline ready"
    );

    let pipeline = IngestPipeline::from_config(&cfg, store.clone(), recipients.clone(), sender, health.clone())?;
    let manager = SubscriptionManager::new(
        Arc::new(RumqttConnector::from_config(&cfg.mqtt)),
        Arc::new(pipeline),
        cfg.topics.list(),
        DispatchSettings::from_config(&cfg.reconnect, &cfg.ingest),
        health.clone(),
    );

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    manager
        .start_with_retry(&shutdown)
        .await
        .context("connecting to MQTT broker")?;

    match cli.collect_for {
        Some(secs) => collect_for(&manager, &store, Duration::from_secs(secs), &shutdown).await,
        None => serve(&cfg, &manager, store, recipients, health, &shutdown).await?,
    }

    manager.stop().await;
    info!("smokewatch kernel stopped");
    Ok(())
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
        shutdown.cancel();
    });
}

async fn serve(
    cfg: &AppConfig,
    manager: &SubscriptionManager,
    store: SharedStore,
    recipients: RecipientRegistry,
    health: HealthTracker,
    shutdown: &CancellationToken,
) -> Result<()> {
    let app = http::build_router(AppState {
        store,
        recipients,
        health,
        connection: manager.watch_state(),
        api_key: cfg.api_key.as_deref().map(Arc::from),
    });
    if cfg.api_key.is_none() {
        warn!("SMOKEWATCH_API_KEY not set, API is read-only and recipients cannot be changed over HTTP");
    }

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server error")
}

async fn collect_for(
    manager: &SubscriptionManager,
    store: &SharedStore,
    window: Duration,
    shutdown: &CancellationToken,
) {
    info!(seconds = window.as_secs(), "collecting readings");
    tokio::select! {
        _ = tokio::time::sleep(window) => {}
        _ = shutdown.cancelled() => {}
    }
    manager.stop().await;

    for kind in ReadingKind::ALL {
        match store.latest(kind) {
            Ok(Some(reading)) => println!("{kind}: {} at {}", reading.value, reading.timestamp),
            _ => println!("{kind}: no data available"),
        }
    }
    println!("records stored: {}", store.info().records);
}
