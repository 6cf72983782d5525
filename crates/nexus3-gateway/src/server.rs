//! HTTP Server (C14): single bind, bearer-token auth, JSON-RPC routing to
//! the global and per-agent dispatchers, and graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::pool::AgentPool;
use crate::rpc::{to_response, Dispatcher, GlobalDispatcher};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub home: PathBuf,
    pub pool: Arc<AgentPool>,
    pub persistence: Option<Arc<nexus3_session::SessionPersistence>>,
}

struct ServerState {
    pool: Arc<AgentPool>,
    persistence: Option<Arc<nexus3_session::SessionPersistence>>,
    global: GlobalDispatcher,
    token: String,
}

pub struct ServerHandle {
    pub bind_addr: SocketAddr,
    pub token: String,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn join(self) -> std::result::Result<(), tokio::task::JoinError> {
        self.join.await
    }
}

fn token_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("token")
}

/// Distinguishes "another NEXUS3 server already owns this port" from "an
/// unrelated service is squatting on it" by TCP-connecting then probing
/// `/health` for the `service: "nexus3"` marker, so bind failures give the
/// operator an actionable error instead of a bare `AddrInUse`.
async fn probe_port(addr: SocketAddr) -> Result<()> {
    let connect = tokio::time::timeout(Duration::from_millis(300), tokio::net::TcpStream::connect(addr)).await;
    let Ok(Ok(_stream)) = connect else {
        return Ok(());
    };

    let client = reqwest::Client::builder().timeout(Duration::from_millis(500)).build().map_err(|e| {
        GatewayError::Internal(format!("failed to build probe client: {e}"))
    })?;
    let url = format!("http://{addr}/health");
    match client.get(&url).send().await {
        Ok(response) => match response.json::<Value>().await {
            Ok(body) if body.get("service").and_then(Value::as_str) == Some("nexus3") => Err(GatewayError::AlreadyRunning),
            _ => Err(GatewayError::PortInUse),
        },
        Err(_) => Err(GatewayError::PortInUse),
    }
}

/// Loads the persisted server token, or generates a fresh one if none
/// exists yet. Callers that need the token's value *before* a successful
/// bind (e.g. to seed the `api_key` a pooled agent's `nexus_*` skills use
/// to call back into this same server) should call this once and hand the
/// same string to both the pool and `ServerConfig::token`, rather than
/// letting `start` resolve it a second time — calling it twice against a
/// not-yet-written token file would mint two different tokens.
pub fn resolve_token(state_dir: &std::path::Path) -> std::io::Result<String> {
    load_or_create_token(state_dir)
}

fn load_or_create_token(home: &std::path::Path) -> std::io::Result<String> {
    let path = token_path(home);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    use base64::Engine as _;
    let mut bytes = [0u8; 32];
    SystemRandom::new().fill(&mut bytes).map_err(|_| std::io::Error::other("failed to generate server token"))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn write_token_file(home: &std::path::Path, token: &str) -> std::io::Result<()> {
    let path = token_path(home);
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(&path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn delete_token_file(home: &std::path::Path) {
    let _ = std::fs::remove_file(token_path(home));
}

/// Binds, serves, and blocks until `shutdown_server` or Ctrl-C fires. The
/// token is generated (if absent) and persisted only after a successful
/// bind, so a failed bind never clobbers a token another instance is using.
pub async fn start(config: ServerConfig) -> Result<ServerHandle> {
    probe_port(config.bind_addr).await?;

    let token = load_or_create_token(&config.home)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let global = GlobalDispatcher::new(config.pool.clone(), shutdown_tx.clone());

    let state = Arc::new(ServerState {
        pool: config.pool.clone(),
        persistence: config.persistence.clone(),
        global,
        token: token.clone(),
    });

    let app = Router::new()
        .route("/", post(global_rpc_handler))
        .route("/rpc", post(global_rpc_handler))
        .route("/agent/:agent_id", post(agent_rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    write_token_file(&config.home, &token)?;
    info!("nexus3 server listening on {bound_addr}");

    let home = config.home.clone();
    let pool = config.pool.clone();
    let mut shutdown_signal = shutdown_rx.clone();

    let join = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown_signal.changed() => {}
            }
        });

        if let Err(e) = server.await {
            warn!("nexus3 server error: {e}");
        }

        shutdown_pool(&pool).await;
        delete_token_file(&home);
        info!("nexus3 server shut down");
    });

    Ok(ServerHandle { bind_addr: bound_addr, token, join })
}

/// Cancels every in-flight request and tears down every pooled agent.
/// Provider HTTP clients close themselves when their last `Arc` drops with
/// the pool.
async fn shutdown_pool(pool: &Arc<AgentPool>) {
    for summary in pool.list() {
        if let Err(e) = pool.destroy(&summary.agent_id).await {
            warn!("error destroying agent {} during shutdown: {e}", summary.agent_id);
        }
    }
}

fn check_auth(state: &ServerState, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), state.token.as_bytes()) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(serde::Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

async fn global_rpc_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(envelope): Json<RpcEnvelope>,
) -> impl IntoResponse {
    if check_auth(&state, &headers).is_err() {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"})));
    }
    let result = state.global.dispatch(&envelope.method, &envelope.params).await;
    (StatusCode::OK, Json(to_response(envelope.id, result)))
}

/// Routes to the agent's live handle, auto-restoring from a saved session
/// on disk when the agent isn't currently active — an active agent always
/// wins over a stale saved copy.
async fn agent_rpc_handler(
    State(state): State<Arc<ServerState>>,
    AxumPath(agent_id): AxumPath<String>,
    headers: HeaderMap,
    Json(envelope): Json<RpcEnvelope>,
) -> impl IntoResponse {
    if check_auth(&state, &headers).is_err() {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"})));
    }

    let handle = match state.pool.get(&agent_id) {
        Some(handle) => handle,
        None => match restore_if_possible(&state, &agent_id).await {
            Ok(handle) => handle,
            Err(e) => {
                let result = Err((e.rpc_code(), e.to_string()));
                return (StatusCode::OK, Json(to_response(envelope.id, result)));
            }
        },
    };

    let dispatcher = Dispatcher::new(handle, state.persistence.clone());
    let result = state
        .pool
        .log_mux()
        .agent_context(agent_id.clone(), dispatcher.dispatch(&envelope.method, &envelope.params))
        .await;
    (StatusCode::OK, Json(to_response(envelope.id, result)))
}

async fn restore_if_possible(state: &ServerState, agent_id: &str) -> Result<Arc<crate::pool::AgentHandle>> {
    let persistence = state.persistence.as_ref().ok_or_else(|| GatewayError::AgentNotFound(agent_id.to_string()))?;
    let saved = persistence.load(agent_id).await.map_err(GatewayError::from)?;
    state.pool.restore_from_saved(saved).await
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "nexus3",
        "version": env!("CARGO_PKG_VERSION"),
        "agents": state.pool.list().len(),
    }))
}
