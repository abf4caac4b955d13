//! Operator API route handlers.
//!
//! All endpoints return JSON. Reads go straight to the ledger; the only
//! mutations are starting and stopping agent schedules.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::AgentScheduler;
use crate::ledger::{Ledger, MarketView};
use crate::types::{
    Agent, AgentId, Cents, ExchangeError, Instrument, InstrumentId, Order, OrderFilter,
    Shareholding, Trade,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub scheduler: Arc<AgentScheduler>,
    pub ledger: Arc<dyn Ledger>,
    pub market: Arc<dyn MarketView>,
    /// Tick interval used when a start request doesn't name one.
    pub default_interval: Duration,
}

pub type AppState = Arc<ApiState>;

/// Default and maximum page size for `/api/trades`.
const DEFAULT_TRADE_LIMIT: u32 = 50;
const MAX_TRADE_LIMIT: u32 = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An `ExchangeError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ExchangeError);

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ExchangeError::Validation(_) => StatusCode::BAD_REQUEST,
            ExchangeError::NotFound(_) => StatusCode::NOT_FOUND,
            ExchangeError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ExchangeError::AlreadyTerminal { .. }
            | ExchangeError::NotAcceptable { .. }
            | ExchangeError::SelfTrade { .. }
            | ExchangeError::InsufficientShares { .. }
            | ExchangeError::InsufficientFunds { .. } => StatusCode::CONFLICT,
            ExchangeError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    #[serde(flatten)]
    pub agent: Agent,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentDetail {
    #[serde(flatten)]
    pub agent: Agent,
    pub running: bool,
    pub holdings: Vec<Shareholding>,
    pub open_orders: Vec<Order>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentSummary {
    #[serde(flatten)]
    pub instrument: Instrument,
    pub last_price: Option<Cents>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResponse {
    pub agent_id: AgentId,
    pub running: bool,
    /// Whether this request changed anything.
    pub changed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartParams {
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TradesParams {
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn require_agent(state: &ApiState, id: AgentId) -> Result<Agent, ApiError> {
    state
        .ledger
        .agent(id)
        .await?
        .ok_or_else(|| ApiError(ExchangeError::NotFound(format!("agent {}", id.0))))
}

/// GET /api/agents
pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Vec<AgentSummary>> {
    let running = state.scheduler.running_agents().await;
    let agents = state
        .ledger
        .agents()
        .await?
        .into_iter()
        .map(|agent| AgentSummary {
            running: running.contains(&agent.id),
            agent,
        })
        .collect();
    Ok(Json(agents))
}

/// GET /api/agents/:id
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<AgentDetail> {
    let agent = require_agent(&state, AgentId(id)).await?;
    let holdings = state.ledger.holdings(agent.id).await?;
    let open_orders = state.ledger.active_orders(agent.id).await?;
    let running = state.scheduler.is_running(agent.id).await;

    Ok(Json(AgentDetail {
        agent,
        running,
        holdings,
        open_orders,
    }))
}

/// POST /api/agents/:id/start
pub async fn start_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<StartParams>,
) -> ApiResult<ScheduleResponse> {
    let agent = require_agent(&state, AgentId(id)).await?;
    let interval = match params.interval_ms {
        Some(0) => {
            return Err(ApiError(ExchangeError::Validation(
                "interval_ms must be positive".to_string(),
            )))
        }
        Some(ms) => Duration::from_millis(ms),
        None => state.default_interval,
    };

    let changed = state.scheduler.start(agent.id, interval).await;
    Ok(Json(ScheduleResponse {
        agent_id: agent.id,
        running: true,
        changed,
    }))
}

/// POST /api/agents/:id/stop
pub async fn stop_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ScheduleResponse> {
    let agent = require_agent(&state, AgentId(id)).await?;
    let changed = state.scheduler.stop(agent.id).await;
    Ok(Json(ScheduleResponse {
        agent_id: agent.id,
        running: false,
        changed,
    }))
}

/// GET /api/instruments
pub async fn list_instruments(State(state): State<AppState>) -> ApiResult<Vec<InstrumentSummary>> {
    let instruments = state.ledger.instruments().await?;
    let mut out = Vec::with_capacity(instruments.len());
    for instrument in instruments {
        let last_price = state.market.latest_price(instrument.id).await?;
        out.push(InstrumentSummary {
            instrument,
            last_price,
        });
    }
    Ok(Json(out))
}

/// GET /api/instruments/:id/orders
pub async fn instrument_orders(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Order>> {
    let instrument_id = InstrumentId(id);
    if state.ledger.instrument(instrument_id).await?.is_none() {
        return Err(ApiError(ExchangeError::NotFound(format!("instrument {id}"))));
    }
    let orders = state
        .ledger
        .open_orders(&OrderFilter {
            instrument_id: Some(instrument_id),
            ..OrderFilter::default()
        })
        .await?;
    Ok(Json(orders))
}

/// GET /api/trades?limit=N
pub async fn recent_trades(
    State(state): State<AppState>,
    Query(params): Query<TradesParams>,
) -> ApiResult<Vec<Trade>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_TRADE_LIMIT)
        .clamp(1, MAX_TRADE_LIMIT);
    Ok(Json(state.ledger.recent_trades(limit).await?))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
