// =============================================================================
// REST bridge — core operations over HTTP
// =============================================================================
//
// Every operation carries an account id; authentication context is the
// operator bearer token (the end-user auth system is external). Handlers are
// thin: validate at the boundary, call into the managers, serialise the
// result.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::OperatorToken;
use crate::app_state::AppState;
use crate::error::EngineError;
use crate::monitoring::MIN_ACTIVE_FREQUENCY_MINUTES;
use crate::reasoning::{ActionKind, InvokeRequest, TradeAction};
use crate::types::{AgentMode, PositionSide};

/// Screenshot constraints on submitPrompt.
pub const MAX_SCREENSHOTS: usize = 5;
pub const MAX_SCREENSHOT_BYTES: usize = 5 * 1024 * 1024;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated operations ────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/portfolio/:account_id", get(portfolio_status))
        .route("/api/v1/ops/place-order", post(place_order))
        .route("/api/v1/ops/cancel-order", post(cancel_order))
        .route("/api/v1/ops/close-all", post(close_all))
        .route("/api/v1/ops/update-leverage", post(update_leverage))
        .route("/api/v1/ops/credentials", post(put_credentials))
        .route("/api/v1/ops/approve-agent", post(approve_agent))
        .route("/api/v1/ops/agent-mode", post(set_agent_mode))
        .route("/api/v1/ops/monitoring-frequency", post(set_monitoring_frequency))
        .route("/api/v1/ops/submit-prompt", post(submit_prompt))
        .route("/api/v1/journal/create", post(journal_create))
        .route("/api/v1/journal/activate", post(journal_activate))
        .route("/api/v1/journal/close", post(journal_close))
        // ── WebSocket feeds ─────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::state_feed_handler))
        .route("/market-data", get(crate::api::ws::market_data_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn engine_error_response(e: &EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        EngineError::InvalidParams { .. } | EngineError::ContentFiltered => StatusCode::BAD_REQUEST,
        EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::NeedsCredentials(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// =============================================================================
// Health & state
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    upstream_connected: bool,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.telemetry.current_version(),
        upstream_connected: state.hub.is_connected(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: OperatorToken, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

#[derive(Deserialize)]
struct PortfolioQuery {
    #[serde(default)]
    capital: Option<f64>,
}

async fn portfolio_status(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(query): Query<PortfolioQuery>,
) -> impl IntoResponse {
    // Without an explicit capital figure, fall back to the last snapshot's
    // account value.
    let capital = match query.capital {
        Some(capital) => capital,
        None => state
            .store
            .latest_snapshot(&account_id)
            .ok()
            .flatten()
            .map(|s| s.account_value)
            .unwrap_or(0.0),
    };

    match state.portfolio.status(&account_id, capital) {
        Ok(status) => Json(status).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// =============================================================================
// Trading operations
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderBody {
    account_id: String,
    strategy_id: String,
    symbol: String,
    kind: ActionKind,
    #[serde(default)]
    side: Option<PositionSide>,
    #[serde(default)]
    size: f64,
    #[serde(default = "default_leverage")]
    leverage: u32,
    #[serde(default)]
    expected_entry: Option<f64>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
    #[serde(default)]
    reasoning: String,
}

fn default_leverage() -> u32 {
    1
}

async fn place_order(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlaceOrderBody>,
) -> impl IntoResponse {
    let account = match state.store.get_account(&body.account_id) {
        Ok(Some(account)) => account,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown account" })),
            )
                .into_response()
        }
    };

    let action = TradeAction {
        kind: body.kind,
        symbol: body.symbol,
        side: body.side,
        size: body.size,
        leverage: body.leverage,
        reasoning: body.reasoning,
        expected_entry: body.expected_entry,
        stop_loss: body.stop_loss,
        take_profit: body.take_profit,
    };

    let passive = account.agent_mode == AgentMode::Passive;
    let outcomes = state
        .executor
        .execute_batch(&body.account_id, &body.strategy_id, &[action], passive)
        .await;
    Json(serde_json::json!({ "results": outcomes })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrderBody {
    account_id: String,
    symbol: String,
    oid: u64,
}

async fn cancel_order(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CancelOrderBody>,
) -> impl IntoResponse {
    let signer = match state.secrets.signer(&body.account_id) {
        Ok(signer) => signer,
        Err(e) => return engine_error_response(&e).into_response(),
    };
    match state.venue.cancel_order(&signer, &body.symbol, body.oid).await {
        Ok(()) => Json(serde_json::json!({ "cancelled": body.oid })).into_response(),
        Err(e) => engine_error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseAllBody {
    account_id: String,
    strategy_id: String,
}

async fn close_all(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseAllBody>,
) -> impl IntoResponse {
    let positions = match state.store.open_positions(&body.account_id) {
        Ok(positions) => positions,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let actions: Vec<TradeAction> = positions
        .iter()
        .map(|pos| TradeAction {
            kind: ActionKind::Close,
            symbol: pos.symbol.clone(),
            side: None,
            size: 0.0,
            leverage: 1,
            reasoning: "close-all requested".into(),
            expected_entry: None,
            stop_loss: None,
            take_profit: None,
        })
        .collect();

    info!(account_id = %body.account_id, count = actions.len(), "close-all requested");
    let outcomes = state
        .executor
        .execute_batch(&body.account_id, &body.strategy_id, &actions, false)
        .await;
    Json(serde_json::json!({ "results": outcomes })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLeverageBody {
    account_id: String,
    symbol: String,
    is_cross: bool,
    leverage: u32,
}

async fn update_leverage(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateLeverageBody>,
) -> impl IntoResponse {
    let signer = match state.secrets.signer(&body.account_id) {
        Ok(signer) => signer,
        Err(e) => return engine_error_response(&e).into_response(),
    };
    match state
        .venue
        .update_leverage(&signer, &body.symbol, body.is_cross, body.leverage)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "leverage": body.leverage })).into_response(),
        Err(e) => engine_error_response(&e).into_response(),
    }
}

// =============================================================================
// Credential onboarding
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsBody {
    account_id: String,
    /// Agent-wallet private key (hex). Sealed into an envelope immediately;
    /// the plaintext never leaves this handler.
    agent_private_key: String,
}

async fn put_credentials(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> impl IntoResponse {
    if state.store.get_account(&body.account_id).ok().flatten().is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown account" })),
        )
            .into_response();
    }

    match state.secrets.put(&body.account_id, &body.agent_private_key) {
        Ok(()) => {
            state.telemetry.increment_version();
            Json(serde_json::json!({ "stored": true })).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveAgentBody {
    payload: crate::venue::signer::ApproveAgentPayload,
    signature: crate::venue::signer::VenueSignature,
}

/// Submit a main-wallet-signed agent approval. The core never holds the main
/// wallet key; the typed data is signed by the external transport.
async fn approve_agent(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApproveAgentBody>,
) -> impl IntoResponse {
    // Recompute the typed-data digest for the audit trail; a payload that
    // does not even hash is rejected before it reaches the venue.
    let digest = match crate::venue::signer::approve_agent_digest(&body.payload) {
        Ok(digest) => digest,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    info!(agent = %body.payload.agent_address, digest = %digest, "submitting agent approval");

    match state.venue.approve_agent(&body.payload, &body.signature).await {
        Ok(()) => Json(serde_json::json!({ "approved": true })).into_response(),
        Err(e) => engine_error_response(&e).into_response(),
    }
}

// =============================================================================
// Account control
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentModeBody {
    account_id: String,
    mode: AgentMode,
}

async fn set_agent_mode(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentModeBody>,
) -> impl IntoResponse {
    let account = match state.store.get_account(&body.account_id) {
        Ok(Some(account)) => account,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown account" })),
            )
                .into_response()
        }
    };

    if let Err(e) = state.store.set_agent_mode(&body.account_id, body.mode) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    let mut frequency = account.monitoring_frequency_minutes;
    match body.mode {
        AgentMode::Active => {
            // Activating with monitoring off promotes the frequency to the
            // minimum so the loop actually runs.
            if frequency == 0 {
                frequency = MIN_ACTIVE_FREQUENCY_MINUTES;
                if let Err(e) = state
                    .store
                    .set_monitoring_frequency(&body.account_id, frequency)
                {
                    warn!(error = %e, "failed to promote monitoring frequency");
                }
            }
            if let Err(e) = state.monitoring.start(&body.account_id, frequency, true) {
                return engine_error_response(&e).into_response();
            }
        }
        AgentMode::Passive => {
            state.monitoring.stop(&body.account_id);
        }
    }
    state.telemetry.increment_version();

    Json(serde_json::json!({
        "agentMode": body.mode,
        "monitoringFrequencyMinutes": frequency
    }))
    .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrequencyBody {
    account_id: String,
    minutes: u64,
}

async fn set_monitoring_frequency(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<FrequencyBody>,
) -> impl IntoResponse {
    if let Err(e) = state
        .store
        .set_monitoring_frequency(&body.account_id, body.minutes)
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    if body.minutes == 0 {
        // Frequency zero suspends the loop.
        state.monitoring.stop(&body.account_id);
    } else if let Err(e) = state.monitoring.restart(&body.account_id, body.minutes) {
        return engine_error_response(&e).into_response();
    }
    state.telemetry.increment_version();

    Json(serde_json::json!({ "monitoringFrequencyMinutes": body.minutes })).into_response()
}

// =============================================================================
// Prompt submission
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitPromptBody {
    account_id: String,
    strategy_id: String,
    prompt: String,
    /// Base64-encoded screenshots; validated here, described (not forwarded)
    /// in the reasoning context.
    #[serde(default)]
    screenshots: Vec<String>,
}

async fn submit_prompt(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitPromptBody>,
) -> impl IntoResponse {
    if body.screenshots.len() > MAX_SCREENSHOTS {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("at most {MAX_SCREENSHOTS} screenshots allowed")
            })),
        )
            .into_response();
    }
    for (i, screenshot) in body.screenshots.iter().enumerate() {
        // Base64 expands by 4/3; compare decoded size against the cap.
        let decoded_len = screenshot.len() / 4 * 3;
        if decoded_len > MAX_SCREENSHOT_BYTES {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("screenshot {i} exceeds {MAX_SCREENSHOT_BYTES} bytes")
                })),
            )
                .into_response();
        }
    }

    let account = match state.store.get_account(&body.account_id) {
        Ok(Some(account)) => account,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown account" })),
            )
                .into_response()
        }
    };

    let outcome = match state
        .router
        .invoke(&InvokeRequest {
            account_id: body.account_id.clone(),
            prompt: body.prompt.clone(),
            context: serde_json::json!({
                "source": "user_prompt",
                "screenshotCount": body.screenshots.len(),
            }),
            preferred_provider: None,
            model: None,
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return engine_error_response(&e).into_response(),
    };

    let passive = account.agent_mode == AgentMode::Passive;
    let results = state
        .executor
        .execute_batch(&body.account_id, &body.strategy_id, &outcome.actions, passive)
        .await;

    Json(serde_json::json!({
        "interpretation": outcome.interpretation,
        "riskManagement": outcome.risk_management,
        "expectedOutcome": outcome.expected_outcome,
        "results": results
    }))
    .into_response()
}

// =============================================================================
// Journal operations
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalCreateBody {
    account_id: String,
    strategy_id: String,
    symbol: String,
    side: String,
    #[serde(default)]
    entry_reasoning: String,
    #[serde(default)]
    expectations: String,
    #[serde(default)]
    planned_entry: Option<f64>,
    #[serde(default)]
    planned_stop: Option<f64>,
    #[serde(default)]
    planned_target: Option<f64>,
}

async fn journal_create(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<JournalCreateBody>,
) -> impl IntoResponse {
    match state.store.create_journal_entry(
        &body.account_id,
        &body.strategy_id,
        &body.symbol,
        &body.side,
        &body.entry_reasoning,
        &body.expectations,
        body.planned_entry,
        body.planned_stop,
        body.planned_target,
    ) {
        Ok(id) => Json(serde_json::json!({ "id": id, "status": "planned" })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalActivateBody {
    id: String,
    entry_price: f64,
    size: f64,
}

async fn journal_activate(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<JournalActivateBody>,
) -> impl IntoResponse {
    match state
        .store
        .activate_journal_entry(&body.id, body.entry_price, body.size)
    {
        Ok(()) => Json(serde_json::json!({ "id": body.id, "status": "active" })).into_response(),
        // Lifecycle violations are client errors, not server faults.
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalCloseBody {
    id: String,
    exit_price: f64,
    pnl: f64,
    #[serde(default)]
    close_analysis: String,
}

async fn journal_close(
    _auth: OperatorToken,
    State(state): State<Arc<AppState>>,
    Json(body): Json<JournalCloseBody>,
) -> impl IntoResponse {
    match state
        .store
        .close_journal_entry(&body.id, body.exit_price, body.pnl, &body.close_analysis)
    {
        Ok(()) => Json(serde_json::json!({ "id": body.id, "status": "closed" })).into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
