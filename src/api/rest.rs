// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and only read the published view,
// except `POST /fetch` which starts a backfill job.
//
// CORS is configured permissively; the API is meant to be bound to loopback
// for a local rendering layer.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::fetcher::FetchRequest;
use crate::indicators::LevelParams;
use crate::market_data::orderbook::LadderRow;
use crate::types::{BookLevel, Candle, Level};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/second-bars", get(second_bars))
        .route("/api/v1/orderbook", get(orderbook))
        .route("/api/v1/levels", get(levels))
        .route("/api/v1/fetch", post(start_fetch))
        .route("/api/v1/fetch/status", get(fetch_status))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    fetch_running: bool,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        fetch_running: state.fetch_status().is_running(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Serialize)]
struct CandlesResponse {
    inst_id: String,
    bar: String,
    candles: Vec<Candle>,
}

/// Series of the last finished backfill, kept current by the live candle
/// stream. `inst_id` and `bar` are those of that backfill, or the configured
/// ones before any backfill has finished.
///
/// A bar appended from the live stream only knows its close: open, high and
/// low equal the close and both volumes are zero until a later backfill
/// overwrites it.
async fn candles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let published = state.candles();
    let (inst_id, bar) = match published.request {
        Some(request) => (request.inst_id, request.bar),
        None => {
            let config = state.runtime_config.read();
            (config.inst_id.clone(), config.bar.clone())
        }
    };
    Json(CandlesResponse {
        inst_id,
        bar,
        candles: published.series.into_vec(),
    })
}

async fn second_bars(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.second_bars())
}

// =============================================================================
// Order book
// =============================================================================

#[derive(Serialize)]
struct OrderBookResponse {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    ladder: Vec<LadderRow>,
    spread_bps: Option<f64>,
    imbalance: f64,
}

async fn orderbook(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.orderbook();
    Json(OrderBookResponse {
        ladder: snapshot.ladder(),
        spread_bps: snapshot.spread_bps(),
        imbalance: snapshot.imbalance(),
        bids: snapshot.bids,
        asks: snapshot.asks,
    })
}

// =============================================================================
// Levels
// =============================================================================

#[derive(Debug, Deserialize)]
struct LevelsQuery {
    eps_multiplier: Option<f64>,
    min_hits: Option<usize>,
}

#[derive(Serialize)]
struct LevelsResponse {
    params: LevelParams,
    levels: Vec<Level>,
}

async fn levels(State(state): State<Arc<AppState>>, Query(query): Query<LevelsQuery>) -> Response {
    let defaults = state.runtime_config.read().level_params();
    let params = LevelParams {
        eps_multiplier: query.eps_multiplier.unwrap_or(defaults.eps_multiplier),
        min_hits: query.min_hits.unwrap_or(defaults.min_hits),
    };

    match state.levels(params) {
        Ok(levels) => Json(LevelsResponse { params, levels }).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// =============================================================================
// Fetch
// =============================================================================

#[derive(Debug, Deserialize)]
struct FetchBody {
    /// Defaults to the configured interval.
    bar: Option<String>,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Serialize)]
struct FetchAccepted {
    job: Uuid,
    request: FetchRequest,
}

async fn start_fetch(State(state): State<Arc<AppState>>, Json(body): Json<FetchBody>) -> Response {
    let (inst_id, default_bar) = {
        let config = state.runtime_config.read();
        (config.inst_id.clone(), config.bar.clone())
    };
    let bar = body.bar.filter(|b| !b.trim().is_empty()).unwrap_or(default_bar);
    let today = Utc::now().date_naive();

    let request = match FetchRequest::from_dates(inst_id, bar, body.start_date, body.end_date, today) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "rejected fetch request");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match state.start_fetch(request.clone()) {
        Ok(job) => {
            info!(%job, "fetch accepted via API");
            (StatusCode::ACCEPTED, Json(FetchAccepted { job, request })).into_response()
        }
        Err(e) => error_response(StatusCode::CONFLICT, e.to_string()),
    }
}

async fn fetch_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": state.fetch_status(),
        "recent_errors": state.recent_errors(),
    }))
}
