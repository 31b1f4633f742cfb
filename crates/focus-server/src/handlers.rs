//! HTTP and WebSocket handlers for the focus server.
//!
//! The WebSocket route runs the session gate before upgrading; everything
//! after the upgrade belongs to the connection lifecycle in `focus-core`.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use focus_auth::{
    rotate, AuthError, CredentialPair, MemoryUserDirectory, SessionGate, TokenClass, UserDirectory,
};
use focus_core::{AuthenticatedConnection, DeliveryEngine, Hub, PendingConnection};
use focus_transport::websocket;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const STATS_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// Registry, delivery and lifecycle.
    pub hub: Hub,
    /// Access credential check for protected routes.
    pub gate: SessionGate,
    /// Users allowed to refresh credentials.
    pub users: Arc<dyn UserDirectory>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state. The engine must be spawned by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential configuration is invalid.
    pub fn new(config: Config) -> Result<(Self, DeliveryEngine)> {
        let credentials = Arc::new(config.auth.credential_manager()?);
        let gate = SessionGate::with_cookie(credentials, config.auth.access_cookie.clone());

        let users = MemoryUserDirectory::new();
        for user in &config.auth.users {
            users.insert(user.as_str());
        }

        let (hub, engine) = Hub::new(config.delivery_config(), config.lifecycle_config());

        let state = Self {
            hub,
            gate,
            users: Arc::new(users),
            config,
        };
        Ok((state, engine))
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("WebSocket upgrade required")]
    UpgradeRequired,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(e) if e.is_unauthenticated() => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response(),
            ApiError::Auth(e) => {
                error!(error = %e, "Auth backend failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal"})),
                )
                    .into_response()
            }
            ApiError::UpgradeRequired => (
                StatusCode::UPGRADE_REQUIRED,
                Json(json!({"error": "upgrade required"})),
            )
                .into_response(),
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/api/v1/auth/refresh", post(refresh_handler))
        .route("/api/v1/auth/logout", post(logout_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.auth.uses_default_secret() {
        warn!("Using the default JWT secret; set auth.jwt_secret before deploying");
    }

    let (state, engine) = AppState::new(config.clone())?;
    let state = Arc::new(state);
    engine.spawn();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    spawn_stats_publisher(state.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Focus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve the router on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn spawn_stats_publisher(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_PUBLISH_INTERVAL);
        loop {
            ticker.tick().await;
            metrics::publish_delivery_stats(&state.hub.stats());
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.registry().len(),
        "delivery": {
            "enqueued": stats.enqueued,
            "dropped": stats.dropped,
            "delivered": stats.delivered,
            "write_failures": stats.write_failures,
        }
    }))
}

/// WebSocket upgrade handler.
///
/// The gate runs before the upgrade is looked at, so a request without a
/// credential gets 401 whether or not it asked to upgrade.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let pending = PendingConnection::generate();
    let conn = match pending.authenticate(state.gate.authenticate(&headers)) {
        Ok(conn) => conn,
        Err(e) => {
            metrics::record_auth_rejection("ws");
            return ApiError::from(e).into_response();
        }
    };

    let Some(ws) = ws else {
        debug!(connection = %conn.id(), "Authenticated request without upgrade");
        return ApiError::UpgradeRequired.into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, remote, conn, state))
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    remote: SocketAddr,
    conn: AuthenticatedConnection,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (sink, stream) = websocket::split(socket, Some(remote));

    match state.hub.lifecycle().run(conn, sink, stream).await {
        Ok(summary) => {
            metrics::record_messages("inbound", summary.frames_received);
            metrics::record_messages("outbound", summary.heartbeats);
        }
        Err(e) => error!(error = %e, "Connection not registered"),
    }
}

/// Exchange the refresh cookie for a new credential pair.
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    let token = jar
        .get(&state.config.auth.refresh_cookie)
        .map(|cookie| cookie.value().to_string())
        .unwrap_or_default();

    let pair = rotate(state.gate.credentials(), state.users.as_ref(), &token)
        .await
        .map_err(|e| {
            if e.is_unauthenticated() {
                metrics::record_auth_rejection("refresh");
                warn!(error = %e, "Refresh rejected");
            }
            e
        })?;

    let jar = set_credential_cookies(jar, &state, &pair);
    Ok((jar, Json(json!({"success": true}))))
}

/// Clear both credential cookies.
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(StatusCode, CookieJar), ApiError> {
    let identity = state.gate.authenticate(&headers).map_err(|e| {
        metrics::record_auth_rejection("logout");
        e
    })?;
    info!(identity = %identity, "Logged out");

    let auth = &state.config.auth;
    let jar = jar
        .add(credential_cookie(&state, auth.access_cookie.clone(), String::new(), 0))
        .add(credential_cookie(&state, auth.refresh_cookie.clone(), String::new(), 0));
    Ok((StatusCode::NO_CONTENT, jar))
}

fn set_credential_cookies(jar: CookieJar, state: &AppState, pair: &CredentialPair) -> CookieJar {
    let auth = &state.config.auth;
    let credentials = state.gate.credentials();
    jar.add(credential_cookie(
        state,
        auth.access_cookie.clone(),
        pair.access_token.clone(),
        credentials.ttl_secs(TokenClass::Access),
    ))
    .add(credential_cookie(
        state,
        auth.refresh_cookie.clone(),
        pair.refresh_token.clone(),
        credentials.ttl_secs(TokenClass::Refresh),
    ))
}

fn credential_cookie(
    state: &AppState,
    name: String,
    value: String,
    max_age_secs: i64,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.auth.secure_cookies)
        .max_age(time::Duration::seconds(max_age_secs))
        .build()
}
