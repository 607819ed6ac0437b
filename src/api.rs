//! REST API server for ZakatChain
//!
//! Provides authenticated HTTP endpoints for accounts, wallets, transfers,
//! mining control, the block explorer, zakat runs and the audit trail.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{self, header, request::Parts, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};

use crate::accounts::{Claims, RegisterRequest};
use crate::amount::Amount;
use crate::audit::{LogStatus, SystemLog};
use crate::crypto::WalletId;
use crate::engine::{MineOutcome, TransferRequest};
use crate::error::{ChainError, ErrorClass};
use crate::node::Node;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub struct ApiError(pub ChainError);

/// HTTP status for an engine error.
pub fn status_for(err: &ChainError) -> StatusCode {
    match err.class() {
        ErrorClass::Validation => match err {
            ChainError::NotFound(_) => StatusCode::NOT_FOUND,
            ChainError::AuthenticationError(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        },
        ErrorClass::Conflict | ErrorClass::Concurrency => StatusCode::CONFLICT,
        ErrorClass::ConsistencyFault | ErrorClass::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let message = self.0.to_string();
        let body = match self.0 {
            ChainError::AlreadyMining => json!({ "error": message, "status": "alreadyMining" }),
            ChainError::ZakatRunInProgress => json!({ "error": message, "status": "zakatRunInProgress" }),
            _ => json!({ "error": message }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Authentication
// ============================================================================

/// Caller identified by a `Bearer` token.
pub struct AuthUser {
    pub claims: Claims,
}

impl AuthUser {
    pub fn wallet_id(&self) -> WalletId {
        WalletId::new(self.claims.wallet_id.clone())
    }
}

#[async_trait]
impl FromRequestParts<Arc<Node>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, node: &Arc<Node>) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ChainError::AuthenticationError("Authorization header required".to_string()))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ChainError::AuthenticationError("Bearer token required".to_string()))?;
        let claims = node.accounts.authenticate(token.trim())?;
        Ok(AuthUser { claims })
    }
}

fn require_admin(node: &Node, user: &AuthUser) -> ApiResult<()> {
    if node.accounts.is_admin(&user.claims.email) {
        Ok(())
    } else {
        Err(ChainError::AuthenticationError("Administrator privileges required".to_string()).into())
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginRequest {
    email: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyOtpRequest {
    email: String,
    otp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpdateProfileRequest {
    full_name: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BeneficiaryRequest {
    name: String,
    wallet_id: String,
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware. Logs method, path, status, duration and the
/// node state.
async fn logging_middleware(State(node): State<Arc<Node>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        node_state = ?node.state(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints (for testing)
pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    let api_routes = Router::new()
        // Auth endpoints
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify-otp", post(verify_otp))
        .route("/auth/profile", get(get_profile).put(update_profile))
        // Wallet endpoints
        .route("/wallet", get(get_wallet))
        .route("/wallet/balance", get(get_balance))
        .route("/wallet/utxos", get(get_utxos))
        .route("/wallet/beneficiaries", post(add_beneficiary).get(list_beneficiaries))
        .route("/wallet/beneficiaries/:id", delete(remove_beneficiary))
        // Transaction endpoints
        .route("/transactions/send", post(send_transaction))
        .route("/transactions/history", get(transaction_history))
        .route("/transactions/pending", get(pending_transactions))
        // Mining endpoints
        .route("/mining/mine", post(mine_block))
        .route("/mining/status", get(mining_status))
        // Explorer endpoints
        .route("/blocks", get(get_blocks))
        .route("/blocks/latest", get(get_latest_block))
        .route("/blocks/validate", get(validate_chain))
        .route("/blocks/:hash", get(get_block_by_hash))
        // Zakat endpoints
        .route("/zakat/history", get(zakat_history))
        .route("/zakat/process", post(process_zakat))
        // Audit endpoints
        .route("/logs/system", get(system_logs))
        .route("/logs/transactions", get(transaction_logs))
        // System endpoints
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(node.clone(), logging_middleware))
        .with_state(node);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serves the API until `shutdown` fires.
pub async fn run_api_server(
    node: Arc<Node>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_api_router(node);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("API server stopped");
    Ok(())
}

// ============================================================================
// Route Handlers: auth
// ============================================================================

async fn register(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let engine = node.engine.clone();
    let (account, _otp) = node.accounts.register(req, |public_key| engine.open_wallet(public_key))?;
    let wallet = node.engine.wallet(&account.wallet_id);

    node.engine.audit().record_system(
        SystemLog::new("user_registered", format!("User {} registered", account.email), LogStatus::Success)
            .with_user(account.id.clone())
            .with_wallet(&account.wallet_id)
            .with_ip(client_ip(&headers)),
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Registration successful. Check your email for the verification code.",
            "user": node.accounts.profile_of(&account),
            "wallet": wallet,
        })),
    ))
}

async fn login(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    node.accounts.login(&req.email)?;
    node.engine.audit().record_system(
        SystemLog::new("login_requested", format!("OTP issued for {}", req.email), LogStatus::Success)
            .with_ip(client_ip(&headers)),
    );
    Ok(Json(json!({ "message": "Verification code sent" })))
}

async fn verify_otp(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(req): Json<VerifyOtpRequest>,
) -> ApiResult<impl IntoResponse> {
    match node.accounts.verify_otp(&req.email, &req.otp) {
        Ok((token, account)) => {
            node.engine.audit().record_system(
                SystemLog::new("login", format!("User {} logged in", account.email), LogStatus::Success)
                    .with_user(account.id.clone())
                    .with_wallet(&account.wallet_id)
                    .with_ip(client_ip(&headers)),
            );
            Ok(Json(json!({
                "token": token,
                "user": node.accounts.profile_of(&account),
            })))
        }
        Err(e) => {
            node.engine.audit().record_system(
                SystemLog::new("login_failed", format!("{}: {}", req.email, e), LogStatus::Error)
                    .with_ip(client_ip(&headers)),
            );
            Err(e.into())
        }
    }
}

async fn get_profile(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let account = node.accounts.get(&user.claims.sub)?;
    Ok(Json(node.accounts.profile_of(&account)))
}

async fn update_profile(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = node
        .accounts
        .update_profile(&user.claims.sub, req.full_name, req.email)?;
    node.engine.audit().record_system(
        SystemLog::new("profile_updated", "Profile updated", LogStatus::Success).with_user(account.id.clone()),
    );
    Ok(Json(node.accounts.profile_of(&account)))
}

// ============================================================================
// Route Handlers: wallet
// ============================================================================

async fn get_wallet(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let wallet_id = user.wallet_id();
    let wallet = node
        .engine
        .wallet(&wallet_id)
        .ok_or_else(|| ChainError::UnknownWallet(wallet_id.to_string()))?;
    Ok(Json(wallet))
}

async fn get_balance(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let wallet_id = user.wallet_id();
    let balance = node.engine.balance_of(&wallet_id)?;
    Ok(Json(json!({ "walletId": wallet_id, "balance": balance })))
}

async fn get_utxos(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let utxos = node.engine.utxos_of(&user.wallet_id())?;
    Ok(Json(json!({ "count": utxos.len(), "utxos": utxos })))
}

async fn add_beneficiary(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Json(req): Json<BeneficiaryRequest>,
) -> ApiResult<impl IntoResponse> {
    let wallet_id = WalletId::new(req.wallet_id.trim().to_lowercase());
    let exists = node.engine.wallet_exists(&wallet_id);
    let beneficiary = node
        .accounts
        .add_beneficiary(&user.claims.sub, &req.name, wallet_id, exists)?;
    Ok((StatusCode::CREATED, Json(beneficiary)))
}

async fn list_beneficiaries(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let beneficiaries = node.accounts.beneficiaries(&user.claims.sub)?;
    Ok(Json(json!({ "count": beneficiaries.len(), "beneficiaries": beneficiaries })))
}

async fn remove_beneficiary(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    node.accounts.remove_beneficiary(&user.claims.sub, &id)?;
    Ok(Json(json!({ "message": "Beneficiary removed" })))
}

// ============================================================================
// Route Handlers: transactions
// ============================================================================

async fn send_transaction(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Json(req): Json<TransferRequest>,
) -> ApiResult<impl IntoResponse> {
    let tx = node.engine.submit_transfer(&user.wallet_id(), req)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Transaction accepted and pending confirmation",
            "transaction": tx,
        })),
    ))
}

async fn transaction_history(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let history = node.engine.history(&user.wallet_id(), query.limit())?;
    Ok(Json(json!({ "count": history.len(), "transactions": history })))
}

async fn pending_transactions(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let pending = node.engine.pending_for(&user.wallet_id());
    Ok(Json(json!({ "count": pending.len(), "transactions": pending })))
}

// ============================================================================
// Route Handlers: mining
// ============================================================================

async fn mine_block(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<Response> {
    let engine = node.engine.clone();
    let miner = user.wallet_id();
    let outcome = tokio::task::spawn_blocking(move || engine.mine(Some(miner)))
        .await
        .map_err(|e| ChainError::IoError(format!("Mining task failed: {}", e)))??;

    let response = match outcome {
        MineOutcome::Mined(block) => (
            StatusCode::CREATED,
            Json(json!({
                "status": "mined",
                "message": format!("Block {} mined", block.header.index),
                "block": block,
            })),
        )
            .into_response(),
        MineOutcome::NoWorkAvailable => Json(json!({
            "status": "noWorkAvailable",
            "message": "No pending transactions to mine",
        }))
        .into_response(),
    };
    Ok(response)
}

async fn mining_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.engine.mining_status())
}

// ============================================================================
// Route Handlers: explorer
// ============================================================================

async fn get_blocks(State(node): State<Arc<Node>>, Query(query): Query<LimitQuery>) -> impl IntoResponse {
    let blocks = node.engine.blocks(query.limit());
    Json(json!({
        "height": node.engine.chain_height(),
        "count": blocks.len(),
        "blocks": blocks,
    }))
}

async fn get_latest_block(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.engine.latest_block())
}

async fn get_block_by_hash(State(node): State<Arc<Node>>, Path(hash): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(node.engine.block_by_hash(&hash)?))
}

async fn validate_chain(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let height = node.engine.chain_height();
    match node.engine.validate_chain() {
        Ok(()) => Json(json!({ "valid": true, "height": height })),
        Err(e) => Json(json!({ "valid": false, "height": height, "error": e.to_string() })),
    }
}

// ============================================================================
// Route Handlers: zakat
// ============================================================================

async fn zakat_history(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let records = node.engine.zakat_book().records(Some(&user.wallet_id()));
    let total: u64 = records.iter().map(|r| r.amount.units()).sum();
    Ok(Json(json!({
        "count": records.len(),
        "total": Amount::from_units(total),
        "records": records,
    })))
}

async fn process_zakat(State(node): State<Arc<Node>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    require_admin(&node, &user)?;
    let scheduler = node.zakat.clone();
    let report = tokio::task::spawn_blocking(move || scheduler.run("manual"))
        .await
        .map_err(|e| ChainError::IoError(format!("Zakat task failed: {}", e)))??;
    Ok(Json(report))
}

// ============================================================================
// Route Handlers: audit & system
// ============================================================================

async fn system_logs(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&node, &user)?;
    let logs = node.engine.audit().system_logs(query.limit());
    Ok(Json(json!({ "count": logs.len(), "logs": logs })))
}

async fn transaction_logs(
    State(node): State<Arc<Node>>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let logs = node
        .engine
        .audit()
        .transaction_logs(Some(&user.wallet_id()), query.limit());
    Ok(Json(json!({ "count": logs.len(), "logs": logs })))
}

async fn health_check(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let state = node.state();
    let status = match state {
        crate::node::NodeState::Degraded | crate::node::NodeState::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(json!({
            "status": if status.is_success() { "healthy" } else { "unhealthy" },
            "nodeState": state,
            "height": node.engine.chain_height(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}
