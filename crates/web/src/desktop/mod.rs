//! Desktop session broker
//!
//! Turns a connection token for a desktop profile into a browser URL on the
//! remote desktop gateway, reusing an existing gateway connection when one
//! of the configured policies matches and creating one otherwise.

pub mod cache;
pub mod gateway;
pub mod matching;
pub mod response;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relaygate_common::{
    Clock, DesktopProtocol, Error, ResolvedParams, ResolvedProfile, ServerKind, TokenBroker,
};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::ApiError;
use cache::{GatewaySession, SessionCache};
use gateway::{GatewayClient, GatewayConnection, GatewayError};
use matching::{find_existing, MatchPolicy, MatchTarget};

const UNAVAILABLE_DETAILS: &str =
    "The remote desktop gateway is not running or cannot be reached. RDP and VNC sessions require it.";

/// Desktop resolution failures
#[derive(Debug, ThisError)]
pub enum BrokerError {
    #[error(transparent)]
    Resolve(#[from] Error),

    #[error("gateway unavailable: {source}")]
    Unavailable {
        server_info: Value,
        source: GatewayError,
    },

    #[error("gateway permission denied: {source}")]
    PermissionDenied {
        server_info: Value,
        fallback_url: String,
        source: GatewayError,
    },

    #[error("gateway connection could not be created: {source}")]
    CreateFailed {
        server_info: Value,
        fallback_url: String,
        source: GatewayError,
    },
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = match self {
            Self::Resolve(e) => return ApiError(e).into_response(),
            Self::Unavailable { server_info, .. } => json!({
                "success": false,
                "message": "Cannot reach the remote desktop gateway. Check that it is deployed and running.",
                "error": "Gateway service unavailable",
                "details": UNAVAILABLE_DETAILS,
                "serverInfo": server_info,
            }),
            Self::PermissionDenied {
                server_info,
                fallback_url,
                source,
            } => json!({
                "success": false,
                "message": "The gateway service account may not create connections. Grant it connection administration rights in the gateway's user settings.",
                "error": "Gateway permission denied",
                "details": source.to_string(),
                "serverInfo": server_info,
                "fallbackUrl": fallback_url,
            }),
            Self::CreateFailed {
                server_info,
                fallback_url,
                source,
            } => json!({
                "success": false,
                "message": source.to_string(),
                "error": "Gateway connection could not be created",
                "details": UNAVAILABLE_DETAILS,
                "serverInfo": server_info,
                "fallbackUrl": fallback_url,
            }),
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

/// A browser-loadable desktop session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopSession {
    pub connection_id: String,
    pub url: String,
    pub reused: bool,
}

impl DesktopSession {
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "success": true,
            "connectionId": self.connection_id,
            "url": self.url,
            "iframeUrl": self.url,
        });
        if self.reused {
            body["message"] = "Using existing connection".into();
        }
        body
    }
}

/// Connection settings taken from a desktop profile
struct DesktopTarget<'a> {
    name: &'a str,
    host: &'a str,
    protocol: DesktopProtocol,
    port: u16,
    username: Option<&'a str>,
    password: Option<&'a str>,
}

impl<'a> DesktopTarget<'a> {
    fn from_profile(profile: &'a ResolvedProfile) -> Result<Self, Error> {
        match &profile.params {
            ResolvedParams::Desktop {
                protocol,
                port,
                username,
                password,
            } => Ok(Self {
                name: &profile.name,
                host: &profile.ip_address,
                protocol: *protocol,
                port: *port,
                username: username.as_deref().filter(|u| !u.is_empty()),
                password: password.as_deref().filter(|p| !p.is_empty()),
            }),
            ResolvedParams::Shell { .. } => Err(Error::ProfileKindMismatch {
                expected: ServerKind::Desktop,
                actual: profile.kind,
            }),
        }
    }

    fn match_target(&self) -> MatchTarget<'a> {
        MatchTarget {
            hostname: self.host,
            port: self.port,
            username: self.username,
        }
    }
}

/// Brokers desktop sessions through the gateway
pub struct DesktopBroker {
    tokens: TokenBroker,
    gateway: GatewayClient,
    cache: SessionCache,
    clock: Arc<dyn Clock>,
    policies: Vec<MatchPolicy>,
    sentinel_name: String,
    base_url: String,
    public_url: String,
}

impl DesktopBroker {
    pub fn new(
        tokens: TokenBroker,
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        let cache = SessionCache::new(
            clock.clone(),
            std::time::Duration::from_secs(config.credential_ttl_secs),
            std::time::Duration::from_secs(config.refresh_margin_secs),
            config.fallback_data_source.clone(),
        );
        Ok(Self {
            tokens,
            gateway: GatewayClient::new(config)?,
            cache,
            clock,
            policies: config.policies.clone(),
            sentinel_name: config.sentinel_name.clone(),
            base_url: config.base_url().to_string(),
            public_url: config.public_base_url().to_string(),
        })
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    fn fallback_url(&self) -> String {
        format!("{}/#/settings/connections", self.base_url)
    }

    /// Check that a gateway credential can be obtained
    pub async fn status(&self) -> Result<(), GatewayError> {
        self.cache.session(&self.gateway).await.map(|_| ())
    }

    /// Resolve a desktop connection token into a gateway session URL
    pub async fn resolve(&self, token: &str) -> Result<DesktopSession, BrokerError> {
        let profile = self.tokens.redeem_for(token, ServerKind::Desktop)?;
        let target = DesktopTarget::from_profile(&profile)?;
        let server_info = profile.server_info();

        let mut session = self.authenticate(&server_info).await?;

        let mut discovered = self.discover(&session, &target).await;
        if matches!(&discovered, Err(e) if e.is_auth_rejected()) {
            info!("Gateway rejected the cached credential, re-authenticating");
            self.cache.invalidate();
            session = self.authenticate(&server_info).await?;
            discovered = self.discover(&session, &target).await;
        }

        match discovered {
            Ok(Some(id)) => return Ok(self.session_for(id, &session, true)),
            Ok(None) => debug!("No reusable gateway connection for {}", target.host),
            Err(e) if e.is_unreachable() => {
                return Err(BrokerError::Unavailable {
                    server_info,
                    source: e,
                })
            }
            Err(e) => debug!("Could not list gateway connections, creating: {}", e),
        }

        let body = self.connection_body(&target)?;

        match self
            .gateway
            .effective_permissions(&session.data_source, &session.auth_token)
            .await
        {
            Ok(perms) => debug!("Gateway service account permissions: {}", perms),
            Err(e) => debug!("Could not read gateway permissions: {}", e),
        }

        match self
            .gateway
            .create_connection(&session.data_source, &session.auth_token, &body)
            .await
        {
            Ok(id) => {
                info!(
                    "Created gateway {} connection {} for {}",
                    target.protocol, id, target.host
                );
                Ok(self.session_for(id, &session, false))
            }
            Err(e) => {
                warn!("Gateway connection creation failed: {}", e);
                if e.is_auth_rejected() {
                    self.cache.invalidate();
                }
                if e.is_unreachable() || matches!(e, GatewayError::PermissionDenied(_)) {
                    return Err(self.classify(e, &server_info));
                }
                // A concurrent request may have created it meanwhile.
                if let Ok(Some(id)) = self.discover(&session, &target).await {
                    return Ok(self.session_for(id, &session, true));
                }
                Err(BrokerError::CreateFailed {
                    server_info,
                    fallback_url: self.fallback_url(),
                    source: e,
                })
            }
        }
    }

    async fn authenticate(&self, server_info: &Value) -> Result<GatewaySession, BrokerError> {
        self.cache.session(&self.gateway).await.map_err(|source| {
            warn!("Gateway authentication failed: {}", source);
            self.classify(source, server_info)
        })
    }

    async fn discover(
        &self,
        session: &GatewaySession,
        target: &DesktopTarget<'_>,
    ) -> Result<Option<String>, GatewayError> {
        let mut connections = self
            .gateway
            .list_connections(&session.data_source, &session.auth_token)
            .await?;

        // Parameters cost one request per connection; fetch them only once a
        // policy that reads them is reached.
        let mut hydrated = false;
        for &policy in &self.policies {
            if policy.needs_parameters() && !hydrated {
                self.hydrate(session, &mut connections).await;
                hydrated = true;
            }
            let found = find_existing(
                &connections,
                &[policy],
                &self.sentinel_name,
                &target.match_target(),
            );
            if let Some((conn, policy)) = found {
                info!(
                    "Reusing gateway connection {} ({:?} match, name {})",
                    conn.identifier, policy, conn.name
                );
                return Ok(Some(conn.identifier.clone()));
            }
        }
        Ok(None)
    }

    async fn hydrate(&self, session: &GatewaySession, connections: &mut [GatewayConnection]) {
        for conn in connections.iter_mut().filter(|c| c.parameters.is_none()) {
            match self
                .gateway
                .connection_parameters(&session.data_source, &session.auth_token, &conn.identifier)
                .await
            {
                Ok(params) => conn.parameters = Some(params),
                Err(e) => debug!("No parameters for connection {}: {}", conn.identifier, e),
            }
        }
    }

    fn connection_body(&self, target: &DesktopTarget<'_>) -> Result<Value, Error> {
        let port = target.port.to_string();
        let parameters = match target.protocol {
            DesktopProtocol::Rdp => {
                let (Some(username), Some(password)) = (target.username, target.password) else {
                    return Err(Error::CredentialMissing(
                        "RDP connections need a username and password".to_string(),
                    ));
                };
                if target.host.is_empty() {
                    return Err(Error::CredentialMissing(
                        "RDP connections need an address".to_string(),
                    ));
                }
                json!({
                    "hostname": target.host,
                    "port": port,
                    "username": username,
                    "password": password,
                    "domain": "",
                    "security": "any",
                    "ignore-cert": "true",
                    "ignore-ssl": "true",
                    "enable-wallpaper": "false",
                    "enable-font-smoothing": "false",
                    "enable-full-window-drag": "false",
                    "enable-desktop-composition": "false",
                    "enable-menu-animations": "false",
                    "disable-bitmap-caching": "true",
                    "disable-offscreen-caching": "true",
                    "color-depth": "16",
                    "width": "1024",
                    "height": "768",
                    "dpi": "96",
                })
            }
            DesktopProtocol::Vnc => json!({
                "hostname": target.host,
                "port": port,
                "password": target.password.unwrap_or(""),
                "color-depth": "32",
                "width": "1920",
                "height": "1080",
                "dpi": "96",
            }),
        };

        Ok(json!({
            "parentIdentifier": "ROOT",
            "name": format!("{}_{}", target.name, self.clock.now().timestamp_millis()),
            "protocol": target.protocol.gateway_name(),
            "attributes": {},
            "parameters": parameters,
        }))
    }

    fn session_for(&self, id: String, session: &GatewaySession, reused: bool) -> DesktopSession {
        let url = format!(
            "{}/#/client/{}?token={}&dataSource={}",
            self.public_url,
            urlencoding::encode(&id),
            urlencoding::encode(&session.auth_token),
            urlencoding::encode(&session.data_source)
        );
        let token = urlencoding::encode(&session.auth_token);
        info!("Desktop client URL: {}", url.replace(&*token, "TOKEN_HIDDEN"));
        DesktopSession {
            connection_id: id,
            url,
            reused,
        }
    }

    fn classify(&self, source: GatewayError, server_info: &Value) -> BrokerError {
        let server_info = server_info.clone();
        match source {
            GatewayError::Unreachable(_) => BrokerError::Unavailable {
                server_info,
                source,
            },
            GatewayError::PermissionDenied(_) => BrokerError::PermissionDenied {
                server_info,
                fallback_url: self.fallback_url(),
                source,
            },
            other => BrokerError::CreateFailed {
                server_info,
                fallback_url: self.fallback_url(),
                source: other,
            },
        }
    }
}
