// Rating Engine - Web Server
// REST API over the vote engine with Axum

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use rating_engine::error::{INVALID_PARAMS_MESSAGE, INVALID_PARAMS_STATUS};
use rating_engine::{
    Ballot, EntityRef, RatingEngine, Settings, SqliteStore, VoteCookie, VoteError, VoteOutcome,
    VoteResult, Voter,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Header an upstream auth layer sets for logged-in users
const USER_HEADER: &str = "x-authenticated-user";

#[derive(Parser)]
#[command(name = "rating-server")]
struct Args {
    #[arg(long, default_value = "ratings.db")]
    db: PathBuf,

    #[arg(long, default_value = "ratings.json")]
    config: PathBuf,

    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    #[arg(long, default_value = "info")]
    log: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<RatingEngine<SqliteStore>>>,
}

impl AppState {
    fn engine(&self) -> Result<MutexGuard<'_, RatingEngine<SqliteStore>>, Response> {
        self.engine.lock().map_err(|_| {
            error!("engine mutex poisoned");
            internal_error()
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message.into()),
        }
    }
}

#[derive(Deserialize)]
struct VoteRequest {
    entity_type: i64,
    object_id: i64,
    field: String,
    /// 0 deletes the current vote unless 0 is a valid score
    #[serde(default)]
    score: Option<i64>,
    /// Explicit removal, needed on ranges that contain 0
    #[serde(default)]
    delete: bool,
}

/// Vote response: status code + message, plus the updated aggregate on success
#[derive(Serialize)]
struct VoteResponse {
    status_code: u8,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<VoteResult>,
}

#[derive(Deserialize)]
struct MineQuery {
    entity_type: i64,
    object_id: i64,
    field: String,
}

#[derive(Serialize)]
struct MineResponse {
    score: Option<i64>,
}

// ============================================================================
// Request helpers
// ============================================================================

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::err("internal error")),
    )
        .into_response()
}

/// Credentials of the caller: auth header, peer IP and every cookie sent
fn voter_from_request(headers: &HeaderMap, ip: IpAddr) -> Voter {
    let user = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty());

    let mut voter = match user {
        Some(user) => Voter::user(user, ip),
        None => Voter::anonymous(ip),
    };

    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(value)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| value.to_string());
            voter = voter.with_cookie(name, value);
        }
    }

    voter
}

fn set_cookie_header(cookie: &VoteCookie) -> Option<HeaderValue> {
    let header = if cookie.clear {
        format!("{}=; Max-Age=0; Path=/; HttpOnly", cookie.name)
    } else {
        format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly",
            cookie.name,
            urlencoding::encode(&cookie.value),
            cookie.max_age_secs
        )
    };
    HeaderValue::from_str(&header).ok()
}

fn vote_response(status_code: u8, content: &str) -> Response {
    let body = VoteResponse {
        status_code,
        content: content.to_string(),
        result: None,
    };
    (StatusCode::OK, Json(ApiResponse::ok(body))).into_response()
}

fn invalid_params_response() -> Response {
    vote_response(INVALID_PARAMS_STATUS, INVALID_PARAMS_MESSAGE)
}

fn vote_error_response(err: VoteError) -> Response {
    if err.is_fatal() {
        error!(error = %err, "vote failed");
        return internal_error();
    }

    vote_response(err.status_code(), err.public_message())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/votes - Cast, change or delete a vote
async fn cast_vote(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            debug!(error = %rejection, "invalid vote payload");
            return invalid_params_response();
        }
    };
    let voter = voter_from_request(&headers, peer.ip());
    let mut engine = match state.engine() {
        Ok(engine) => engine,
        Err(response) => return response,
    };

    let entity = EntityRef::new(req.entity_type, req.object_id);
    let ballot = match engine.field(req.entity_type, &req.field) {
        Ok(field) => match Ballot::from_request(req.score, req.delete, field) {
            Some(ballot) => ballot,
            None => return invalid_params_response(),
        },
        Err(err) => return vote_error_response(err),
    };

    match engine.submit_vote(entity, &req.field, ballot, &voter) {
        Ok(VoteOutcome::Applied(result)) => {
            let cookie = result.cookie.as_ref().and_then(set_cookie_header);
            let body = VoteResponse {
                status_code: result.status_code(),
                content: result.message().to_string(),
                result: Some(result),
            };

            let mut response = (StatusCode::OK, Json(ApiResponse::ok(body))).into_response();
            if let Some(cookie) = cookie {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            response
        }
        Ok(outcome) => vote_response(outcome.status_code(), outcome.message()),
        Err(err) => vote_error_response(err),
    }
}

/// GET /api/votes/mine - Score the caller currently has on a field
async fn my_vote(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<MineQuery>,
) -> Response {
    let voter = voter_from_request(&headers, peer.ip());
    let engine = match state.engine() {
        Ok(engine) => engine,
        Err(response) => return response,
    };

    let entity = EntityRef::new(query.entity_type, query.object_id);
    match engine.rating_for_voter(entity, &query.field, &voter) {
        Ok(score) => {
            (StatusCode::OK, Json(ApiResponse::ok(MineResponse { score }))).into_response()
        }
        Err(err @ VoteError::UnknownField { .. }) => {
            (StatusCode::NOT_FOUND, Json(ApiResponse::err(err.to_string()))).into_response()
        }
        Err(err) => {
            error!(error = %err, "lookup of caller's vote failed");
            internal_error()
        }
    }
}

/// GET /api/aggregates/:type/:object/:field - Current aggregate of one field
async fn get_aggregate(
    State(state): State<AppState>,
    Path((entity_type, object_id, field)): Path<(i64, i64, String)>,
) -> Response {
    let engine = match state.engine() {
        Ok(engine) => engine,
        Err(response) => return response,
    };

    match engine.aggregate(EntityRef::new(entity_type, object_id), &field) {
        Ok(snapshot) => (StatusCode::OK, Json(ApiResponse::ok(snapshot))).into_response(),
        Err(err @ VoteError::UnknownField { .. }) => {
            (StatusCode::NOT_FOUND, Json(ApiResponse::err(err.to_string()))).into_response()
        }
        Err(err) => {
            error!(error = %err, "aggregate lookup failed");
            internal_error()
        }
    }
}

fn app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/votes", post(cast_vote))
        .route("/votes/mine", get(my_vote))
        .route("/aggregates/:type/:object/:field", get(get_aggregate))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    println!("🌐 Rating Engine - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let settings = Settings::from_file(&args.config)?;
    let registry = settings.registry()?;
    let store = SqliteStore::open(&args.db)?;
    println!("✓ Database opened: {:?}", args.db);
    println!("✓ Rating fields: {}", registry.field_count());

    let state = AppState {
        engine: Arc::new(Mutex::new(RatingEngine::new(store, registry, settings.engine))),
    };

    let app = app(state);

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "listening");

    println!("\n🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/votes", args.addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
