//! Shared fixtures for the web integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use relaygate_common::{ManualClock, NewServerProfile, ServerProfile, User};
use relaygate_web::terminal::shell::{
    PtyRequest, ShellConnector, ShellEvent, ShellSession, ShellTarget,
};
use relaygate_web::terminal::BridgeError;
use relaygate_web::{WebConfig, WebServer, WebServerState};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

// ============================================================================
// Relaygate under test
// ============================================================================

pub struct TestApp {
    pub addr: SocketAddr,
    pub state: Arc<WebServerState>,
    pub clock: Arc<ManualClock>,
    pub owner: User,
    pub jwt: String,
    pub http: reqwest::Client,
}

impl TestApp {
    pub async fn spawn(gateway_url: &str, connector: Arc<dyn ShellConnector>) -> Self {
        Self::spawn_with(WebConfig::for_testing(gateway_url), connector).await
    }

    pub async fn spawn_with(config: WebConfig, connector: Arc<dyn ShellConnector>) -> Self {
        let clock = Arc::new(ManualClock::default());
        let db = relaygate_common::Database::open_memory().unwrap();
        let server = WebServer::with_parts(&config, db, connector, clock.clone()).unwrap();
        let state = server.state();

        let owner = state.db.create_user("owner@example.com", Some("Owner")).unwrap();
        let jwt = state.auth.issue(owner.id, chrono::Duration::hours(1)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve_listener(listener));

        Self {
            addr,
            state,
            clock,
            owner,
            jwt,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/ssh", self.addr)
    }

    pub fn add_server(&self, owner: &User, profile: NewServerProfile) -> ServerProfile {
        self.state
            .db
            .insert_server(owner.id, &profile, self.state.tokens.vault())
            .unwrap()
    }

    /// Issue a token through the HTTP API
    pub async fn generate(&self, server: &ServerProfile) -> String {
        let resp = self
            .http
            .post(self.url("/api/connect/generate"))
            .bearer_auth(&self.jwt)
            .json(&json!({ "serverId": server.id }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }
}

/// An address nothing listens on
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Poll `cond` until it holds or `within` elapses
pub async fn eventually(within: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ============================================================================
// Scripted shell
// ============================================================================

/// In-memory shell: prints a banner, echoes input, `exit` closes the
/// session and `warn` writes to stderr.
#[derive(Default)]
pub struct ScriptedConnector {
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<u8>>>,
    pub targets: Mutex<Vec<ShellTarget>>,
    pub resizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn open(
        &self,
        target: &ShellTarget,
        _pty: &PtyRequest,
    ) -> Result<Box<dyn ShellSession>, BridgeError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(target.clone());

        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(ShellEvent::Stdout(b"welcome\r\n".to_vec()));
        Ok(Box::new(ScriptedSession {
            events,
            rx,
            closed: self.closed.clone(),
            received: self.received.clone(),
            resizes: self.resizes.clone(),
            line: Vec::new(),
        }))
    }
}

struct ScriptedSession {
    events: mpsc::UnboundedSender<ShellEvent>,
    rx: mpsc::UnboundedReceiver<ShellEvent>,
    closed: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<(u32, u32)>>>,
    line: Vec<u8>,
}

#[async_trait]
impl ShellSession for ScriptedSession {
    async fn write(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        self.received.lock().extend_from_slice(data);
        for &b in data {
            if b != b'\n' {
                self.line.push(b);
                continue;
            }
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            match line.as_str() {
                "exit" => {
                    let _ = self.events.send(ShellEvent::Stdout(b"logout\r\n".to_vec()));
                    let _ = self.events.send(ShellEvent::Closed);
                }
                "warn" => {
                    let _ = self.events.send(ShellEvent::Stderr(b"careful\n".to_vec()));
                }
                "ls" => {
                    let _ = self
                        .events
                        .send(ShellEvent::Stdout(b"bin  etc  home\r\n".to_vec()));
                }
                other => {
                    let _ = self
                        .events
                        .send(ShellEvent::Stdout(format!("{}\r\n", other).into_bytes()));
                }
            }
        }
        Ok(())
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }

    async fn next_event(&mut self) -> ShellEvent {
        self.rx.recv().await.unwrap_or(ShellEvent::Closed)
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector whose handshake never finishes
pub struct HangingConnector;

#[async_trait]
impl ShellConnector for HangingConnector {
    async fn open(
        &self,
        _target: &ShellTarget,
        _pty: &PtyRequest,
    ) -> Result<Box<dyn ShellSession>, BridgeError> {
        std::future::pending::<Result<Box<dyn ShellSession>, BridgeError>>().await
    }
}

// ============================================================================
// Mock desktop gateway
// ============================================================================

pub const GATEWAY_TOKEN: &str = "gw-auth-token";

/// Axum stand-in for the gateway API. Auth tokens are `gw-auth-token-{n}`
/// for the n-th login; `revoke` invalidates every token issued so far.
#[derive(Default)]
pub struct MockGateway {
    pub token_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub param_calls: AtomicUsize,
    pub revoked_below: AtomicUsize,
    pub deny_create: bool,
    pub fail_create: bool,
    /// Creation fails, but only after another client created the same connection
    pub race_create: bool,
    /// Creation takes longer than any sensible client timeout
    pub slow_create: bool,
    pub connections: Mutex<BTreeMap<String, (String, BTreeMap<String, String>)>>,
    pub created_bodies: Mutex<Vec<Value>>,
}

impl MockGateway {
    /// Serve the mock on an ephemeral port; returns its base URL
    pub async fn spawn(self: Arc<Self>) -> String {
        let app = Router::new()
            .route("/api/tokens", post(mock_tokens))
            .route("/api/session/data", get(mock_data_sources))
            .route(
                "/api/session/data/:ds/connections",
                get(mock_list).post(mock_create),
            )
            .route(
                "/api/session/data/:ds/connections/:id/parameters",
                get(mock_parameters),
            )
            .route(
                "/api/session/data/:ds/self/effectivePermissions",
                get(mock_permissions),
            )
            .with_state(self);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    pub fn revoke(&self) {
        self.revoked_below
            .store(self.token_calls.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn authorized(&self, q: &HashMap<String, String>) -> bool {
        q.get("token")
            .and_then(|t| t.strip_prefix(GATEWAY_TOKEN))
            .and_then(|n| n.strip_prefix('-'))
            .and_then(|n| n.parse::<usize>().ok())
            .is_some_and(|n| n > self.revoked_below.load(Ordering::SeqCst))
    }

    pub fn seed(&self, id: &str, name: &str, params: &[(&str, &str)]) {
        self.connections.lock().insert(
            id.to_string(),
            (
                name.to_string(),
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        );
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Permission Denied.", "type": "INVALID_CREDENTIALS"})),
    )
        .into_response()
}

async fn mock_tokens(
    State(gw): State<Arc<MockGateway>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    tokio::time::sleep(Duration::from_millis(30)).await;
    if form.get("username").map(String::as_str) != Some("guacadmin") {
        return unauthorized();
    }
    let n = gw.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"authToken": format!("{}-{}", GATEWAY_TOKEN, n), "username": "guacadmin"}))
        .into_response()
}

async fn mock_data_sources(
    State(gw): State<Arc<MockGateway>>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !gw.authorized(&q) {
        return unauthorized();
    }
    Json(json!({"mysql": {"identifier": "mysql"}})).into_response()
}

async fn mock_list(
    State(gw): State<Arc<MockGateway>>,
    Path(_ds): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !gw.authorized(&q) {
        return unauthorized();
    }
    gw.list_calls.fetch_add(1, Ordering::SeqCst);
    // Like the real gateway, the listing carries no parameters.
    let listing: serde_json::Map<String, Value> = gw
        .connections
        .lock()
        .iter()
        .map(|(id, (name, _))| {
            (
                id.clone(),
                json!({"identifier": id, "name": name, "protocol": "rdp", "parentIdentifier": "ROOT"}),
            )
        })
        .collect();
    Json(Value::Object(listing)).into_response()
}

async fn mock_parameters(
    State(gw): State<Arc<MockGateway>>,
    Path((_ds, id)): Path<(String, String)>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !gw.authorized(&q) {
        return unauthorized();
    }
    gw.param_calls.fetch_add(1, Ordering::SeqCst);
    match gw.connections.lock().get(&id) {
        Some((_, params)) => Json(json!(params)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn mock_permissions(
    State(gw): State<Arc<MockGateway>>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !gw.authorized(&q) {
        return unauthorized();
    }
    Json(json!({"systemPermissions": ["CREATE_CONNECTION"]})).into_response()
}

async fn mock_create(
    State(gw): State<Arc<MockGateway>>,
    Path(_ds): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if !gw.authorized(&q) {
        return unauthorized();
    }
    gw.create_calls.fetch_add(1, Ordering::SeqCst);
    gw.created_bodies.lock().push(body.clone());

    if gw.deny_create {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"message": "Permission Denied.", "type": "PERMISSION_DENIED"})),
        )
            .into_response();
    }
    if gw.slow_create {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    if gw.race_create {
        let params: BTreeMap<String, String> =
            serde_json::from_value(body["parameters"].clone()).unwrap_or_default();
        let mut conns = gw.connections.lock();
        let id = format!("raced-{}", conns.len() + 1);
        conns.insert(id, ("created elsewhere".to_string(), params));
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Connection name already in use", "type": "BAD_REQUEST"})),
        )
            .into_response();
    }
    if gw.fail_create {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Connection parameters invalid", "type": "BAD_REQUEST"})),
        )
            .into_response();
    }

    let mut conns = gw.connections.lock();
    let id = (conns.len() + 1).to_string();
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let params: BTreeMap<String, String> =
        serde_json::from_value(body["parameters"].clone()).unwrap_or_default();
    conns.insert(id.clone(), (name.clone(), params));

    Json(json!({"identifier": id, "name": name, "protocol": body["protocol"]})).into_response()
}
