//! # REST + JSON-RPC + WebSocket API
//!
//! Builds the axum router that exposes the ledger over HTTP. All endpoints
//! share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                            | Description                    |
//! |--------|---------------------------------|--------------------------------|
//! | GET    | `/health`                       | Liveness probe                 |
//! | GET    | `/status`                       | Ledger status summary          |
//! | POST   | `/rpc`                          | JSON-RPC 2.0 gateway           |
//! | GET    | `/ws`                           | WebSocket for committed events |
//! | GET    | `/users/:address`               | Vault of a user (or vault)     |
//! | GET    | `/users/:address/savings/:name` | A single saving                |
//! | GET    | `/events?since=N`               | Event log suffix               |
//! | GET    | `/metrics`                      | Prometheus metrics             |
//!
//! ## Callers
//!
//! The node does not authenticate. Commands name their sender in `from`
//! and attach native value as a decimal wei string in `value`, the way a
//! development chain accepts unsigned transactions. Every amount on the
//! wire is a decimal wei string.
//!
//! Ledger failures are JSON-RPC errors with code `-32000` and the
//! condition name in `data.code`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRef, Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bitsave_contracts::{
    Bitsave, BitsaveError, CallContext, ChildVault, CreateSavingParams, Receipt, Saving,
};
use bitsave_protocol::types::amount_str;
use bitsave_protocol::{Address, BitsaveConfig, EventLog, EventRecord, InMemoryTokenLedger, TokenLedger};

use crate::clock::BlockClock;
use crate::metrics::{self, SharedMetrics};
use crate::stream::BroadcastEventLog;

/// Broadcast channel capacity for live event streaming.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// JSON-RPC code for ledger failures.
const LEDGER_ERROR_CODE: i32 = -32000;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The ledger.
    pub bitsave: Arc<Bitsave>,
    /// Token balances backing token savings and points payouts.
    pub tokens: Arc<InMemoryTokenLedger>,
    /// Block time source for incoming commands.
    pub clock: Arc<BlockClock>,
    /// Committed events, fanned out to WebSocket subscribers.
    pub event_tx: broadcast::Sender<EventRecord>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Deploys a ledger over `log`, publishing its commits to subscribers.
    pub fn new(
        config: BitsaveConfig,
        log: Arc<dyn EventLog>,
        metrics: SharedMetrics,
        version: String,
    ) -> Result<Self, BitsaveError> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let log = Arc::new(BroadcastEventLog::new(log, event_tx.clone()));
        let tokens = Arc::new(InMemoryTokenLedger::new());
        let bitsave = Arc::new(Bitsave::new(config, tokens.clone(), log)?);

        Ok(Self {
            version,
            bitsave,
            tokens,
            clock: Arc::new(BlockClock::new()),
            event_tx,
            metrics,
            started_at: chrono::Utc::now(),
        })
    }

    fn call(&self, from: Address, value: u128) -> CallContext {
        CallContext::new(from, self.clock.now()).with_value(value)
    }

    /// Records the outcome of a ledger command in the metrics.
    fn settle<T>(
        &self,
        command: &str,
        result: Result<Receipt<T>, BitsaveError>,
    ) -> Result<Receipt<T>, JsonRpcError> {
        match result {
            Ok(receipt) => {
                self.metrics.record_command(command, "ok");
                self.metrics
                    .events_committed_total
                    .inc_by(receipt.events.len() as u64);
                self.metrics
                    .registered_users
                    .set(i64::try_from(self.bitsave.user_count()).unwrap_or(i64::MAX));
                Ok(receipt)
            }
            Err(e) => {
                self.metrics.record_command(command, e.code());
                Err(e.into())
            }
        }
    }
}

impl FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.metrics)
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .route("/users/:address", get(user_handler))
        .route("/users/:address/savings/:name", get(saving_handler))
        .route("/events", get(events_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// JSON-RPC Types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version. Must be "2.0".
    pub jsonrpc: String,
    /// The method to invoke.
    pub method: String,
    /// Named parameters.
    pub params: Option<Value>,
    /// Request identifier. Echoed back in the response.
    pub id: Value,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version. Always "2.0".
    pub jsonrpc: String,
    /// The result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request identifier, echoed from the request.
    pub id: Value,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i32,
    /// Short human-readable error description.
    pub message: String,
    /// Optional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    fn invalid_params(e: serde_json::Error) -> Self {
        Self {
            code: -32602,
            message: format!("Invalid params: {}", e),
            data: None,
        }
    }

}

impl From<BitsaveError> for JsonRpcError {
    fn from(e: BitsaveError) -> Self {
        Self {
            code: LEDGER_ERROR_CODE,
            message: e.to_string(),
            data: Some(json!({ "code": e.code() })),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC Params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CallParams {
    from: Address,
    #[serde(default, with = "amount_str")]
    value: u128,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    from: Address,
    #[serde(default, with = "amount_str")]
    value: u128,
    #[serde(flatten)]
    saving: CreateSavingParams,
}

#[derive(Debug, Deserialize)]
struct IncrementParams {
    from: Address,
    #[serde(default, with = "amount_str")]
    value: u128,
    name: String,
    #[serde(default)]
    token_id: Address,
    #[serde(default, with = "amount_str")]
    amount: u128,
}

#[derive(Debug, Deserialize)]
struct WithdrawParams {
    from: Address,
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user: Address,
}

#[derive(Debug, Deserialize)]
struct SavingParams {
    user: Address,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SweepParams {
    from: Address,
    user: Address,
}

#[derive(Debug, Deserialize)]
struct AmountParams {
    from: Address,
    #[serde(with = "amount_str")]
    amount: u128,
}

#[derive(Debug, Deserialize)]
struct ApproveParams {
    from: Address,
    token_id: Address,
    #[serde(with = "amount_str")]
    amount: u128,
}

#[derive(Debug, Deserialize)]
struct MintParams {
    from: Address,
    token_id: Address,
    to: Address,
    #[serde(with = "amount_str")]
    amount: u128,
}

#[derive(Debug, Deserialize)]
struct TokenBalanceParams {
    token_id: Address,
    holder: Address,
}

#[derive(Debug, Deserialize)]
struct IncreaseTimeParams {
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    #[serde(default)]
    since: u64,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({}))).map_err(JsonRpcError::invalid_params)
}

fn receipt_json<T>(receipt: &Receipt<T>, output: Value) -> Value {
    json!({
        "tx_id": receipt.tx_id.to_string(),
        "output": output,
        "events": receipt.events,
    })
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    pub protocol_address: Address,
    pub master: Address,
    pub stable_coin: Address,
    pub cs_token: Address,
    pub user_count: u64,
    #[serde(with = "amount_str")]
    pub fee_pool: u128,
    #[serde(with = "amount_str")]
    pub join_fee: u128,
    #[serde(with = "amount_str")]
    pub saving_fee: u128,
    /// Events committed so far.
    pub event_count: u64,
    /// Block time new commands are stamped with.
    pub block_time: u64,
    pub uptime_secs: i64,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// A token balance held by a vault.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token_id: Address,
    #[serde(with = "amount_str")]
    pub amount: u128,
}

/// Response payload for `GET /users/:address`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VaultResponse {
    pub owner: Address,
    pub vault: Address,
    pub created_at: u64,
    #[serde(with = "amount_str")]
    pub native_balance: u128,
    pub token_balances: Vec<TokenBalance>,
    #[serde(with = "amount_str")]
    pub total_points: u128,
    /// Every saving record, in creation order.
    pub savings: Vec<Saving>,
}

impl From<&ChildVault> for VaultResponse {
    fn from(vault: &ChildVault) -> Self {
        Self {
            owner: vault.owner(),
            vault: vault.address(),
            created_at: vault.created_at(),
            native_balance: vault.native_balance(),
            token_balances: vault
                .token_balances()
                .into_iter()
                .map(|(token_id, amount)| TokenBalance { token_id, amount })
                .collect(),
            total_points: vault.total_points(),
            savings: vault.savings().cloned().collect(),
        }
    }
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Ledger condition name, when the failure came from the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    fn bad_address(raw: &str) -> Response {
        let body = ErrorResponse {
            error: format!("invalid address: {}", raw),
            code: None,
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }

    fn ledger(e: BitsaveError) -> Response {
        let status = match e {
            BitsaveError::UserNotRegistered(_) | BitsaveError::InvalidSaving { .. } => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            code: Some(e.code().to_string()),
            error: e.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Query string for `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<u64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
///
/// This is the liveness probe for orchestrators (k8s, systemd, etc.).
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// `GET /status`: returns the ledger summary.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let b = &state.bitsave;
    let now = chrono::Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        protocol_address: b.address(),
        master: b.master_address(),
        stable_coin: b.stable_coin(),
        cs_token: b.cs_token(),
        user_count: b.user_count(),
        fee_pool: b.fee_pool(),
        join_fee: b.join_fee(),
        saving_fee: b.saving_fee(),
        event_count: b.event_count(),
        block_time: state.clock.now(),
        uptime_secs: (now - state.started_at).num_seconds(),
        timestamp: now.to_rfc3339(),
    })
}

/// `POST /rpc`: JSON-RPC 2.0 gateway.
///
/// Unknown methods return error code -32601 (Method not found).
async fn rpc_handler(
    State(state): State<AppState>,
    Json(req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    if req.jsonrpc != "2.0" {
        return Json(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError::invalid_request(
                "Invalid Request: jsonrpc must be \"2.0\"",
            )),
            id: req.id,
        });
    }

    let timer = state.metrics.rpc_latency_seconds.start_timer();
    let outcome = dispatch(&state, &req.method, req.params);
    timer.observe_duration();

    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e)),
    };
    Json(JsonRpcResponse {
        jsonrpc: "2.0".into(),
        result,
        error,
        id: req.id,
    })
}

/// Routes a JSON-RPC method to the ledger.
fn dispatch(state: &AppState, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let b = &state.bitsave;
    match method {
        // -- Commands ---------------------------------------------------------
        "bitsave_joinBitsave" => {
            let p: CallParams = parse(params)?;
            let r = state.settle("joinBitsave", b.join_bitsave(state.call(p.from, p.value)))?;
            Ok(receipt_json(
                &r,
                json!({ "vault": r.output.vault, "refund": r.output.refund.to_string() }),
            ))
        }
        "bitsave_createSaving" => {
            let p: CreateParams = parse(params)?;
            let r = state.settle(
                "createSaving",
                b.create_saving(state.call(p.from, p.value), p.saving),
            )?;
            Ok(receipt_json(&r, json!(r.output)))
        }
        "bitsave_incrementSaving" => {
            let p: IncrementParams = parse(params)?;
            let r = state.settle(
                "incrementSaving",
                b.increment_saving(state.call(p.from, p.value), &p.name, p.token_id, p.amount),
            )?;
            Ok(receipt_json(&r, json!(r.output)))
        }
        "bitsave_withdrawSaving" => {
            let p: WithdrawParams = parse(params)?;
            let r = state.settle(
                "withdrawSaving",
                b.withdraw_saving(state.call(p.from, 0), &p.name),
            )?;
            let w = &r.output;
            Ok(receipt_json(
                &r,
                json!({
                    "token_id": w.token_id,
                    "amount": w.amount.to_string(),
                    "penalty": w.penalty.to_string(),
                    "points_paid": w.points_paid.to_string(),
                }),
            ))
        }
        "bitsave_sweepVault" => {
            let p: SweepParams = parse(params)?;
            let r = state.settle("sweepVault", b.sweep_vault(state.call(p.from, 0), p.user))?;
            Ok(receipt_json(&r, json!(r.output.to_string())))
        }
        "bitsave_collectFees" => {
            let p: AmountParams = parse(params)?;
            let r = state.settle(
                "collectFees",
                b.collect_fees(state.call(p.from, 0), p.amount),
            )?;
            Ok(receipt_json(&r, json!(r.output.to_string())))
        }

        // -- Queries ----------------------------------------------------------
        "bitsave_getUserChildContractAddress" => {
            let p: UserParams = parse(params)?;
            Ok(json!(b.user_child_contract_address(p.user)?))
        }
        "bitsave_getSaving" => {
            let p: SavingParams = parse(params)?;
            Ok(json!(b.get_saving(p.user, &p.name)?))
        }
        "bitsave_listSavings" => {
            let p: UserParams = parse(params)?;
            Ok(json!(b.list_savings(p.user)?))
        }
        "bitsave_totalPoints" => {
            let p: UserParams = parse(params)?;
            Ok(json!(b.total_points(p.user)?.to_string()))
        }
        "bitsave_userCount" => Ok(json!(b.user_count())),
        "bitsave_stableCoin" => Ok(json!(b.stable_coin())),
        "bitsave_csToken" => Ok(json!(b.cs_token())),
        "bitsave_masterAddress" => Ok(json!(b.master_address())),
        "bitsave_protocolAddress" => Ok(json!(b.address())),
        "bitsave_feePool" => Ok(json!(b.fee_pool().to_string())),
        "bitsave_joinFee" => Ok(json!(b.join_fee().to_string())),
        "bitsave_savingFee" => Ok(json!(b.saving_fee().to_string())),
        "bitsave_getEvents" => {
            let p: EventsParams = parse(params)?;
            Ok(json!(b.events_since(p.since)?))
        }

        // -- Development helpers ----------------------------------------------
        "bitsave_approve" => {
            let p: ApproveParams = parse(params)?;
            state.tokens.approve(p.token_id, p.from, b.address(), p.amount);
            Ok(json!(true))
        }
        "bitsave_mintToken" => {
            let p: MintParams = parse(params)?;
            if p.from != b.master_address() {
                return Err(BitsaveError::MasterCallRequired(p.from).into());
            }
            state
                .tokens
                .mint(p.token_id, p.to, p.amount)
                .map_err(BitsaveError::from)?;
            Ok(json!(true))
        }
        "bitsave_tokenBalance" => {
            let p: TokenBalanceParams = parse(params)?;
            Ok(json!(state
                .tokens
                .balance_of(p.token_id, p.holder)
                .to_string()))
        }
        "bitsave_increaseTime" => {
            let p: IncreaseTimeParams = parse(params)?;
            let offset = state.clock.advance(p.seconds);
            tracing::info!(seconds = p.seconds, offset, "block time advanced");
            Ok(json!(state.clock.now()))
        }
        "bitsave_blockTime" => Ok(json!(state.clock.now())),

        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

/// `GET /users/:address`: the vault of a user, by user or vault address.
async fn user_handler(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Ok(address) = address.parse::<Address>() else {
        return ErrorResponse::bad_address(&address);
    };
    match state.bitsave.vault_snapshot(address) {
        Ok(vault) => (StatusCode::OK, Json(VaultResponse::from(&vault))).into_response(),
        Err(e) => ErrorResponse::ledger(e),
    }
}

/// `GET /users/:address/savings/:name`: one saving record, valid or not.
async fn saving_handler(
    Path((address, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let Ok(address) = address.parse::<Address>() else {
        return ErrorResponse::bad_address(&address);
    };
    match state.bitsave.get_saving(address, &name) {
        Ok(saving) => (StatusCode::OK, Json(saving)).into_response(),
        Err(e) => ErrorResponse::ledger(e),
    }
}

/// `GET /events?since=N`: committed events with `seq >= N`.
async fn events_handler(
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> Response {
    match state.bitsave.events_since(query.since.unwrap_or(0)) {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => {
            tracing::error!("failed to read event log: {}", e);
            ErrorResponse::ledger(e)
        }
    }
}

/// `GET /ws`: WebSocket upgrade for live event streaming.
///
/// Clients receive each committed [`EventRecord`] as a JSON text message.
/// The connection is push-only; client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection, forwarding broadcast events
/// until the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();
    state.metrics.ws_subscribers.inc();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(record) => {
                        let payload = match serde_json::to_string(&record) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    state.metrics.ws_subscribers.dec();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
