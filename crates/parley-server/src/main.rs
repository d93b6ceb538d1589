use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use parley_api::middleware::require_auth;
use parley_api::{AppState, AppStateInner, conversations};
use parley_chat::ChatService;
use parley_crypto::{MessageCodec, StaticKeyProvider, keys};
use parley_gateway::auth::{Authenticator, JwtAuthenticator};
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::rate_limit::{RateLimiter, RedisCounter};

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    chat: Arc<ChatService>,
    limiter: Arc<RateLimiter>,
    authenticator: Arc<dyn Authenticator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let rate_limit: u64 = std::env::var("PARLEY_RATE_LIMIT")
        .unwrap_or_else(|_| "500".into())
        .parse()?;
    let rate_window: u64 = std::env::var("PARLEY_RATE_WINDOW_SECS")
        .unwrap_or_else(|_| "86400".into())
        .parse()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);

    // Message key: injected via config in production, generated for dev
    let key_provider = match std::env::var("PARLEY_MESSAGE_KEY") {
        Ok(encoded) => StaticKeyProvider::from_base64(&encoded)?,
        Err(_) => {
            warn!("PARLEY_MESSAGE_KEY not set; using a generated key — stored messages will be unreadable after restart");
            StaticKeyProvider::new(keys::generate_key())
        }
    };
    let codec = MessageCodec::new(Arc::new(key_provider));

    // Shared state
    let chat = Arc::new(ChatService::new(db.clone(), codec));
    let dispatcher = Dispatcher::new();
    let limiter = Arc::new(build_rate_limiter(rate_limit, Duration::from_secs(rate_window)).await);
    let authenticator: Arc<dyn Authenticator> =
        Arc::new(JwtAuthenticator::new(jwt_secret, db.clone()));

    let app_state: AppState = Arc::new(AppStateInner { chat: chat.clone() });
    let state = ServerState {
        dispatcher,
        chat,
        limiter,
        authenticator,
    };

    // Routes
    let api_routes = Router::new()
        .route("/chat/conversations/start", post(conversations::start_conversation))
        .route("/chat/conversations", get(conversations::list_conversations))
        .route(
            "/chat/conversations/{conversation_id}/messages",
            get(conversations::list_messages),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(api_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Prefer the shared Redis counter when configured; otherwise (or when the
/// connection cannot be established) run with the process-local window.
/// Without a shared store the effective global limit can reach N× the
/// configured one across N instances.
async fn build_rate_limiter(limit: u64, window: Duration) -> RateLimiter {
    let Ok(redis_url) = std::env::var("PARLEY_REDIS_URL") else {
        info!("No PARLEY_REDIS_URL; rate limiting is process-local");
        return RateLimiter::new(limit, window);
    };

    match connect_redis(&redis_url).await {
        Ok(manager) => {
            info!("Rate limiting backed by shared Redis counter");
            RateLimiter::with_shared(limit, window, Arc::new(RedisCounter::new(manager)))
        }
        Err(e) => {
            warn!("Redis unavailable ({}); rate limiting is process-local", e);
            RateLimiter::new(limit, window)
        }
    }
}

async fn connect_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    Ok(redis::aio::ConnectionManager::new(client).await?)
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: Option<String>,
}

/// Authenticate the bearer credential before the upgrade completes: a bad
/// or missing token terminates the connection before any event is read.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let authenticator = state.authenticator.clone();
    let user = match tokio::task::spawn_blocking(move || authenticator.authenticate(&token)).await {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => {
            warn!("Gateway connection refused: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            error!("spawn_blocking auth error: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher.clone(),
            state.chat.clone(),
            state.limiter.clone(),
            user,
        )
    })
    .into_response()
}
