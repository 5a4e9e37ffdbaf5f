//! Desktop session brokering against a mock gateway

mod common;

use common::{dead_address, MockGateway, ScriptedConnector, TestApp, GATEWAY_TOKEN};
use relaygate_common::{DesktopProtocol, NewServerProfile, ServerProfile};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;

async fn app_with(gateway: &Arc<MockGateway>) -> TestApp {
    let url = gateway.clone().spawn().await;
    TestApp::spawn(&url, Arc::new(ScriptedConnector::default())).await
}

fn rdp_profile(app: &TestApp, host: &str) -> ServerProfile {
    app.add_server(
        &app.owner,
        NewServerProfile::desktop("win-desk", host, DesktopProtocol::Rdp)
            .with_username("administrator")
            .with_password("Winpass1!"),
    )
}

async fn resolve(app: &TestApp, token: &str) -> (u16, Value) {
    let resp = app
        .http
        .get(app.url(&format!("/api/guacamole/connection/{}", token)))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn creates_then_reuses_connection() {
    let gateway = Arc::new(MockGateway::default());
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.0.0.5");

    let token = app.generate(&server).await;
    let (status, first) = resolve(&app, &token).await;
    assert_eq!(status, 200, "{first}");
    assert_eq!(first["success"], true);
    assert!(first.get("message").is_none());

    let url = first["url"].as_str().unwrap();
    assert_eq!(first["iframeUrl"], url);
    assert!(url.contains(&format!("/#/client/{}", first["connectionId"].as_str().unwrap())));
    assert!(url.contains(&format!("token={}", GATEWAY_TOKEN)));
    assert!(url.contains("dataSource=mysql"));

    let body = gateway.created_bodies.lock()[0].clone();
    assert_eq!(body["protocol"], "rdp");
    assert_eq!(body["parentIdentifier"], "ROOT");
    assert!(body["name"].as_str().unwrap().starts_with("win-desk_"));
    let params = &body["parameters"];
    assert_eq!(params["hostname"], "10.0.0.5");
    assert_eq!(params["port"], "3389");
    assert_eq!(params["username"], "administrator");
    assert_eq!(params["password"], "Winpass1!");
    assert_eq!(params["ignore-cert"], "true");

    // A second token for the same target lands on the same connection.
    let token = app.generate(&server).await;
    let (status, second) = resolve(&app, &token).await;
    assert_eq!(status, 200);
    assert_eq!(second["connectionId"], first["connectionId"]);
    assert_eq!(second["message"], "Using existing connection");
    assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn vnc_connection_body() {
    let gateway = Arc::new(MockGateway::default());
    let app = app_with(&gateway).await;
    let server = app.add_server(
        &app.owner,
        NewServerProfile::desktop("vnc-box", "10.0.0.9", DesktopProtocol::Vnc),
    );

    let token = app.generate(&server).await;
    let (status, _) = resolve(&app, &token).await;
    assert_eq!(status, 200);

    let body = gateway.created_bodies.lock()[0].clone();
    assert_eq!(body["protocol"], "vnc");
    assert_eq!(body["parameters"]["port"], "5900");
    assert_eq!(body["parameters"]["password"], "");
    assert!(body["parameters"].get("username").is_none());
}

#[tokio::test]
async fn sentinel_connection_is_preferred() {
    let gateway = Arc::new(MockGateway::default());
    gateway.seed("7", "Test", &[("hostname", "192.168.1.1"), ("port", "3389")]);
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.0.0.5");

    let token = app.generate(&server).await;
    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 200);
    assert_eq!(body["connectionId"], "7");
    assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sentinel_match_skips_parameter_lookups() {
    let gateway = Arc::new(MockGateway::default());
    gateway.seed("1", "office-a", &[("hostname", "10.1.1.1"), ("port", "3389")]);
    gateway.seed("2", "office-b", &[("hostname", "10.1.1.2"), ("port", "3389")]);
    gateway.seed("3", "TEST", &[("hostname", "192.168.1.1"), ("port", "3389")]);
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.1.1.2");

    let token = app.generate(&server).await;
    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 200);
    assert_eq!(body["connectionId"], "3");
    assert_eq!(gateway.param_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exact_match_fetches_parameters() {
    let gateway = Arc::new(MockGateway::default());
    gateway.seed("1", "office-a", &[("hostname", "10.1.1.1"), ("port", "3389")]);
    gateway.seed(
        "2",
        "office-b",
        &[("hostname", "10.1.1.2"), ("port", "3389"), ("username", "administrator")],
    );
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.1.1.2");

    let token = app.generate(&server).await;
    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 200);
    assert_eq!(body["connectionId"], "2");
    assert_eq!(gateway.param_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_gateway_is_503_without_fallback() {
    let app = TestApp::spawn(&dead_address().await, Arc::new(ScriptedConnector::default())).await;
    let server = rdp_profile(&app, "10.0.0.5");
    let token = app.generate(&server).await;

    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 503);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Gateway service unavailable");
    assert!(body.get("fallbackUrl").is_none());
    assert!(body.get("reason").is_none());
    assert_eq!(body["serverInfo"]["name"], "win-desk");
    assert_eq!(body["serverInfo"]["ipAddress"], "10.0.0.5");
    assert_eq!(body["serverInfo"]["desktopType"], "RDP");

    let text = body.to_string();
    assert!(!text.contains("Winpass1!"));
    assert!(!text.contains("administrator"));
}

#[tokio::test]
async fn gateway_timeout_does_not_expose_auth_token() {
    let gateway = Arc::new(MockGateway {
        slow_create: true,
        ..Default::default()
    });
    let url = gateway.clone().spawn().await;
    let mut config = relaygate_web::WebConfig::for_testing(&url);
    config.gateway.timeout_secs = 1;
    let app = TestApp::spawn_with(config, Arc::new(ScriptedConnector::default())).await;
    let server = rdp_profile(&app, "10.0.0.5");
    let token = app.generate(&server).await;

    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "Gateway service unavailable");
    assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 1);

    let text = body.to_string();
    assert!(!text.contains(GATEWAY_TOKEN), "auth token in body: {text}");
    assert!(!text.contains("token="), "request URL in body: {text}");
}

#[tokio::test]
async fn failed_create_recovers_connection_made_concurrently() {
    let gateway = Arc::new(MockGateway {
        race_create: true,
        ..Default::default()
    });
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.0.0.5");
    let token = app.generate(&server).await;

    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["connectionId"], "raced-1");
    assert_eq!(body["message"], "Using existing connection");
    assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn revoked_credential_is_replaced() {
    let gateway = Arc::new(MockGateway::default());
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.0.0.5");

    let token = app.generate(&server).await;
    let (status, first) = resolve(&app, &token).await;
    assert_eq!(status, 200);
    assert_eq!(gateway.token_calls.load(Ordering::SeqCst), 1);

    // The gateway forgets the session long before the cached lifetime ends.
    gateway.revoke();

    let token = app.generate(&server).await;
    let (status, second) = resolve(&app, &token).await;
    assert_eq!(status, 200, "{second}");
    assert_eq!(second["connectionId"], first["connectionId"]);
    assert!(second["url"]
        .as_str()
        .unwrap()
        .contains(&format!("token={}-2", GATEWAY_TOKEN)));
    assert_eq!(gateway.token_calls.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permission_denied_offers_fallback() {
    let gateway = Arc::new(MockGateway {
        deny_create: true,
        ..Default::default()
    });
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.0.0.5");
    let token = app.generate(&server).await;

    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "Gateway permission denied");
    assert!(body["fallbackUrl"]
        .as_str()
        .unwrap()
        .ends_with("/#/settings/connections"));
    assert!(!body.to_string().contains("Winpass1!"));
}

#[tokio::test]
async fn create_failure_offers_fallback() {
    let gateway = Arc::new(MockGateway {
        fail_create: true,
        ..Default::default()
    });
    let app = app_with(&gateway).await;
    let server = rdp_profile(&app, "10.0.0.5");
    let token = app.generate(&server).await;

    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "Gateway connection could not be created");
    assert!(body.get("fallbackUrl").is_some());
    assert_ne!(body["message"], "");
}

#[tokio::test]
async fn shell_token_and_missing_credentials_are_400() {
    let gateway = Arc::new(MockGateway::default());
    let app = app_with(&gateway).await;

    let shell = app.add_server(&app.owner, NewServerProfile::shell("box", "10.0.0.1"));
    let token = app.generate(&shell).await;
    let (status, body) = resolve(&app, &token).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    let no_password = app.add_server(
        &app.owner,
        NewServerProfile::desktop("win", "10.0.0.2", DesktopProtocol::Rdp)
            .with_username("administrator"),
    );
    let token = app.generate(&no_password).await;
    let (status, _) = resolve(&app, &token).await;
    assert_eq!(status, 400);
    assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_token_is_404() {
    let gateway = Arc::new(MockGateway::default());
    let app = app_with(&gateway).await;
    let (status, _) = resolve(&app, "nope").await;
    assert_eq!(status, 404);
    assert_eq!(gateway.token_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_resolves_share_one_credential() {
    let gateway = Arc::new(MockGateway::default());
    let app = Arc::new(app_with(&gateway).await);
    let server = rdp_profile(&app, "10.0.0.5");

    let mut tokens = Vec::new();
    for _ in 0..8 {
        tokens.push(app.generate(&server).await);
    }

    let handles: Vec<_> = tokens
        .into_iter()
        .map(|token| {
            let app = app.clone();
            tokio::spawn(async move { resolve(&app, &token).await.0 })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }
    assert_eq!(gateway.token_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn status_reports_gateway_health() {
    let gateway = Arc::new(MockGateway::default());
    let app = app_with(&gateway).await;
    let body: Value = app
        .http
        .get(app.url("/api/guacamole/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "connected");
    assert!(body["guacamoleUrl"].as_str().unwrap().starts_with("http://"));

    let app = TestApp::spawn(&dead_address().await, Arc::new(ScriptedConnector::default())).await;
    let body: Value = app
        .http
        .get(app.url("/api/guacamole/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "disconnected");
    assert_eq!(body["success"], false);
}
