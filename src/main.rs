// =============================================================================
// Meridian Perps Autopilot — Main Entry Point
// =============================================================================
//
// Startup order matters: the master key is validated (with a roundtrip
// self-test) before any subsystem that could need a credential, and monitors
// are restored only after the market-data hub and schedulers are running.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod evaluation;
mod executor;
mod indicators;
mod market_data;
mod monitoring;
mod portfolio;
mod reasoning;
mod regime;
mod runtime_config;
mod secret_store;
mod store;
mod triggers;
mod types;
mod venue;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, Telemetry};
use crate::executor::TradeExecutor;
use crate::indicators::IndicatorEngine;
use crate::market_data::MarketDataHub;
use crate::monitoring::MonitoringManager;
use crate::portfolio::PortfolioManager;
use crate::reasoning::{ProviderKind, ReasoningRouter, RouterConfig};
use crate::runtime_config::RuntimeConfig;
use crate::secret_store::SecretStore;
use crate::store::Store;
use crate::venue::client::VenueClient;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Perps Autopilot — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("MERIDIAN_DB_PATH") {
        config.db_path = path;
    }

    info!(
        venue = %config.venue_api_url,
        db = %config.db_path,
        "runtime configuration resolved"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let store = Store::open(&config.db_path)?;

    // ── 3. Secret store (fatal without a master key; self-test runs here) ─
    let secrets = Arc::new(SecretStore::from_env(store.clone())?);

    // ── 4. Core engines ──────────────────────────────────────────────────
    let engine = Arc::new(IndicatorEngine::new());
    let hub = MarketDataHub::start(config.venue_ws_url.clone(), engine.clone());
    let venue = Arc::new(VenueClient::new(
        config.venue_api_url.clone(),
        Duration::from_secs(config.venue_deadline_secs),
    ));

    let platform_provider = ProviderKind::parse(&config.platform_provider).unwrap_or_else(|| {
        warn!(
            provider = %config.platform_provider,
            "unknown platform provider in config — defaulting to openai"
        );
        ProviderKind::OpenAi
    });
    let router = Arc::new(ReasoningRouter::new(
        store.clone(),
        secrets.clone(),
        RouterConfig {
            platform_provider,
            openai_model: config.openai_model.clone(),
            anthropic_model: config.anthropic_model.clone(),
            deadline: Duration::from_secs(config.reasoning_deadline_secs),
            concurrency: config.provider_concurrency,
        },
    ));

    let portfolio = Arc::new(PortfolioManager::new(store.clone()));

    let (snapshot_tx, snapshot_rx) = mpsc::channel::<String>(64);
    let trade_executor = Arc::new(TradeExecutor::new(
        venue.clone(),
        secrets.clone(),
        store.clone(),
        portfolio.clone(),
        engine.clone(),
        config.candle_interval.clone(),
        snapshot_tx,
    ));

    let telemetry = Arc::new(Telemetry::default());

    let monitoring = MonitoringManager::new(
        store.clone(),
        venue.clone(),
        engine.clone(),
        hub.clone(),
        router.clone(),
        trade_executor.clone(),
        telemetry.clone(),
        config.candle_interval.clone(),
        Duration::from_secs(config.trigger_poll_secs),
        config.default_heartbeat_minutes,
    );

    // ── 5. Background schedulers ─────────────────────────────────────────
    tokio::spawn(run_snapshot_scheduler(
        store.clone(),
        venue.clone(),
        monitoring.clone(),
        snapshot_rx,
        Duration::from_secs(config.snapshot_cadence_secs),
    ));

    tokio::spawn(run_aggregation_scheduler(store.clone()));

    // ── 6. Restore monitors for active + approved accounts ───────────────
    monitoring.restore_all();

    // ── 7. Bridge API server ─────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(RwLock::new(config.clone())),
        store: store.clone(),
        secrets,
        venue,
        engine,
        hub,
        router,
        portfolio,
        executor: trade_executor,
        monitoring: monitoring.clone(),
        telemetry,
    });

    let bind_addr = config.bind_addr.clone();
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "bridge API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    for (account_id, _) in monitoring.monitored_accounts() {
        monitoring.stop(&account_id);
    }

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Meridian Perps Autopilot shut down complete.");
    Ok(())
}

// =============================================================================
// Schedulers
// =============================================================================

/// Portfolio snapshots: on demand after successful order batches (queue), and
/// on a periodic cadence while any monitor is active.
async fn run_snapshot_scheduler(
    store: Arc<Store>,
    venue: Arc<VenueClient>,
    monitoring: Arc<MonitoringManager>,
    mut requests: mpsc::Receiver<String>,
    cadence: Duration,
) {
    let mut ticker = tokio::time::interval(cadence);

    loop {
        tokio::select! {
            request = requests.recv() => {
                match request {
                    Some(account_id) => write_snapshot(&store, &venue, &account_id).await,
                    None => return,
                }
            }
            _ = ticker.tick() => {
                for (account_id, _) in monitoring.monitored_accounts() {
                    write_snapshot(&store, &venue, &account_id).await;
                }
            }
        }
    }
}

async fn write_snapshot(store: &Arc<Store>, venue: &Arc<VenueClient>, account_id: &str) {
    let Ok(Some(account)) = store.get_account(account_id) else {
        return;
    };
    let Some(address) = account.main_wallet_address else {
        return;
    };

    match venue.user_state(&address).await {
        Ok(user_state) => {
            let detail = serde_json::json!({
                "positions": user_state.positions,
                "withdrawable": user_state.withdrawable,
            });
            if let Err(e) = store.insert_snapshot(
                account_id,
                user_state.account_value,
                user_state.total_margin_used,
                user_state.positions.len() as u32,
                &detail,
            ) {
                error!(account_id, error = %e, "snapshot write failed");
            }
        }
        Err(e) => {
            warn!(account_id, error = %e, "snapshot skipped: user state unavailable");
        }
    }
}

/// Daily learning aggregation: checked hourly, run at most once per account
/// per 24 h. The strategy daily-loss counters roll over in the same pass.
async fn run_aggregation_scheduler(store: Arc<Store>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();

        let accounts = match store.active_approved_accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "aggregation scheduler failed to list accounts");
                continue;
            }
        };

        for account in accounts {
            if !evaluation::aggregation_due(&store, &account.id, now) {
                continue;
            }
            match evaluation::run_daily_aggregation(&store, &account.id, now) {
                Ok(report) => {
                    if let Err(e) = store.reset_daily_losses(&account.id) {
                        error!(account_id = %account.id, error = %e, "daily loss reset failed");
                    }
                    info!(
                        account_id = %account.id,
                        decayed = report.decayed,
                        archived = report.archived,
                        "aggregation run recorded"
                    );
                }
                Err(e) => {
                    error!(account_id = %account.id, error = %e, "daily aggregation failed");
                }
            }
        }
    }
}
