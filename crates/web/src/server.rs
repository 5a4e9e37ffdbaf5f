//! HTTP server
//!
//! Token issuance and redemption, the terminal WebSocket and the desktop
//! broker endpoints.

use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relaygate_common::{Clock, Database, SystemClock, TokenBroker, Vault};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::OwnerAuth;
use crate::config::WebConfig;
use crate::desktop::DesktopBroker;
use crate::error::ApiError;
use crate::terminal::shell::ShellConnector;
use crate::terminal::ssh::RusshConnector;
use crate::terminal::TerminalBridge;

/// Shared handler state
pub struct WebServerState {
    pub db: Database,
    pub tokens: TokenBroker,
    pub auth: OwnerAuth,
    pub terminal: Arc<TerminalBridge>,
    pub desktop: DesktopBroker,
}

/// Relaygate web server
pub struct WebServer {
    state: Arc<WebServerState>,
    cors_origin: Option<String>,
}

impl WebServer {
    /// Build the production server: on-disk database, SSH via russh, system clock
    pub fn new(config: &WebConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&config.database_path)?;
        Self::with_parts(
            config,
            db,
            Arc::new(RusshConnector::new()),
            Arc::new(SystemClock),
        )
    }

    /// Build a server from explicit collaborators
    pub fn with_parts(
        config: &WebConfig,
        db: Database,
        connector: Arc<dyn ShellConnector>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let vault_key = config.vault_key.as_deref().unwrap_or_default();
        let jwt_secret = config.jwt_secret.as_deref().unwrap_or_default();

        let tokens = TokenBroker::new(db.clone(), Arc::new(Vault::new(vault_key)), clock.clone());
        let terminal = Arc::new(TerminalBridge::new(
            tokens.clone(),
            connector,
            config.ssh.clone(),
        ));
        let desktop = DesktopBroker::new(tokens.clone(), &config.gateway, clock)?;

        Ok(Self {
            state: Arc::new(WebServerState {
                db,
                tokens,
                auth: OwnerAuth::new(jwt_secret),
                terminal,
                desktop,
            }),
            cors_origin: config.cors_origin.clone(),
        })
    }

    pub fn state(&self) -> Arc<WebServerState> {
        self.state.clone()
    }

    /// Create router
    pub fn router(&self) -> Router {
        let origin = match self.cors_origin.as_deref().map(HeaderValue::from_str) {
            Some(Ok(origin)) => AllowOrigin::exact(origin),
            Some(Err(_)) => {
                warn!("Ignoring invalid CORS origin; allowing any");
                AllowOrigin::from(Any)
            }
            None => AllowOrigin::from(Any),
        };

        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/connect/generate", post(generate_handler))
            .route("/api/connect/:token", get(redeem_handler))
            .route("/ws/ssh", get(terminal_ws_handler))
            .route("/api/guacamole/connection/:token", get(desktop_connection_handler))
            .route("/api/guacamole/status", get(desktop_status_handler))
            .layer(
                CorsLayer::new()
                    .allow_origin(origin)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relaygate listening on http://{}", listener.local_addr()?);
        self.serve_listener(listener).await
    }
}

/// Build and run the production server
pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config.listen_addr.parse()?;
    let server = WebServer::new(&config)?;
    server.serve(addr).await
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "relaygate",
        "version": relaygate_common::VERSION,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(default)]
    server_id: Option<String>,
}

async fn generate_handler(
    State(state): State<Arc<WebServerState>>,
    headers: HeaderMap,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let owner = match state.auth.authenticate(&headers, &state.db) {
        Ok(owner) => owner,
        Err((status, msg)) => {
            return (status, Json(serde_json::json!({"success": false, "message": msg})))
                .into_response()
        }
    };

    let server_id = match body.ok().and_then(|Json(req)| req.server_id) {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"success": false, "message": "serverId is required"})),
            )
                .into_response()
        }
    };

    let Ok(server_id) = Uuid::parse_str(server_id.trim()) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"success": false, "message": "server not found"})),
        )
            .into_response();
    };

    match state.tokens.issue(owner.id, server_id) {
        Ok(token) => Json(serde_json::json!({
            "success": true,
            "token": token.token,
            "url": format!("/connect/{}", token.token),
            "expiresAt": token.expires_at,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn redeem_handler(
    State(state): State<Arc<WebServerState>>,
    Path(token): Path<String>,
) -> Response {
    match state.tokens.redeem(&token) {
        Ok(profile) => Json(serde_json::json!({
            "success": true,
            "server": profile.to_public_json(),
            "token": token,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn terminal_ws_handler(
    State(state): State<Arc<WebServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let bridge = state.terminal.clone();
    ws.on_upgrade(move |socket| bridge.handle_socket(socket))
}

async fn desktop_connection_handler(
    State(state): State<Arc<WebServerState>>,
    Path(token): Path<String>,
) -> Response {
    match state.desktop.resolve(&token).await {
        Ok(session) => Json(session.to_json()).into_response(),
        Err(e) => {
            warn!("Desktop resolution failed: {}", e);
            e.into_response()
        }
    }
}

async fn desktop_status_handler(State(state): State<Arc<WebServerState>>) -> Response {
    match state.desktop.status().await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "status": "connected",
            "guacamoleUrl": state.desktop.public_url(),
        }))
        .into_response(),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "status": "disconnected",
            "error": e.to_string(),
        }))
        .into_response(),
    }
}
