//! REST client for the remote desktop gateway

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use super::cache::{CredentialSource, TokenGrant};
use super::response::connection_identifier;
use crate::config::GatewayConfig;

/// Gateway call failures
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection refused, DNS failure or timeout
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("gateway permission denied: {0}")]
    PermissionDenied(String),

    #[error("gateway returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected gateway response: {0}")]
    Response(String),
}

impl GatewayError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// The gateway refused the auth token
    pub fn is_auth_rejected(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::Status { status: 401 | 403, .. }
        )
    }
}

// Request URLs carry the auth token in the query string; never keep them.
impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        let unreachable = e.is_connect() || e.is_timeout();
        let message = e.without_url().to_string();
        if unreachable {
            Self::Unreachable(message)
        } else {
            Self::Response(message)
        }
    }
}

/// An existing connection as listed by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConnection {
    pub identifier: String,
    pub name: String,
    pub protocol: Option<String>,
    /// Absent when the listing omits parameters and they were not fetched
    pub parameters: Option<BTreeMap<String, String>>,
}

impl GatewayConnection {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.as_ref()?.get(key).map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct ListedConnection {
    #[serde(default)]
    name: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    parameters: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    auth_token: String,
    #[serde(default)]
    data_source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Thin wrapper over the gateway's HTTP API
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Response(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url().to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn data_url(&self, data_source: &str, path: &str, auth_token: &str) -> String {
        format!(
            "{}/api/session/data/{}{}?token={}",
            self.base_url,
            urlencoding::encode(data_source),
            path,
            urlencoding::encode(auth_token)
        )
    }

    /// List existing connections, keyed by identifier
    pub async fn list_connections(
        &self,
        data_source: &str,
        auth_token: &str,
    ) -> Result<Vec<GatewayConnection>, GatewayError> {
        let url = self.data_url(data_source, "/connections", auth_token);
        let resp = check(self.http.get(url).send().await?).await?;
        let raw: BTreeMap<String, Value> = resp.json().await?;

        Ok(raw
            .into_iter()
            .filter_map(|(identifier, entry)| {
                let listed = serde_json::from_value::<ListedConnection>(entry).ok()?;
                Some(GatewayConnection {
                    identifier,
                    name: listed.name,
                    protocol: listed.protocol,
                    parameters: listed.parameters,
                })
            })
            .collect())
    }

    /// Fetch one connection's parameters
    pub async fn connection_parameters(
        &self,
        data_source: &str,
        auth_token: &str,
        identifier: &str,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        let path = format!("/connections/{}/parameters", urlencoding::encode(identifier));
        let url = self.data_url(data_source, &path, auth_token);
        let resp = check(self.http.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Permissions of the service account, for diagnostics
    pub async fn effective_permissions(
        &self,
        data_source: &str,
        auth_token: &str,
    ) -> Result<Value, GatewayError> {
        let url = self.data_url(data_source, "/self/effectivePermissions", auth_token);
        let resp = check(self.http.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Create a connection and return its identifier
    pub async fn create_connection(
        &self,
        data_source: &str,
        auth_token: &str,
        body: &Value,
    ) -> Result<String, GatewayError> {
        let url = self.data_url(data_source, "/connections", auth_token);
        let resp = check(self.http.post(url).json(body).send().await?).await?;
        let body: Value = resp.json().await?;
        connection_identifier(body).map_err(GatewayError::Response)
    }
}

#[async_trait]
impl CredentialSource for GatewayClient {
    async fn authenticate(&self) -> Result<TokenGrant, GatewayError> {
        let url = format!("{}/api/tokens", self.base_url);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        let resp = check(self.http.post(url).form(&form).send().await?).await?;
        let token: TokenResponse = resp.json().await?;
        debug!("Gateway issued auth token");

        Ok(TokenGrant {
            auth_token: token.auth_token,
            data_source: token.data_source.filter(|d| !d.is_empty()),
        })
    }

    async fn discover_data_source(&self, auth_token: &str) -> Result<Option<String>, GatewayError> {
        let url = format!(
            "{}/api/session/data?token={}",
            self.base_url,
            urlencoding::encode(auth_token)
        );
        let resp = check(self.http.get(url).send().await?).await?;
        let sources: BTreeMap<String, Value> = resp.json().await?;
        Ok(sources.into_keys().next())
    }
}

/// Turn non-success statuses into typed errors
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text).ok();
    let message = body
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| text.chars().take(200).collect());

    let denied = status == reqwest::StatusCode::FORBIDDEN
        || message.contains("Permission Denied")
        || body
            .as_ref()
            .and_then(|b| b.kind.as_deref())
            .is_some_and(|k| k == "PERMISSION_DENIED");

    if denied {
        Err(GatewayError::PermissionDenied(message))
    } else {
        Err(GatewayError::Status {
            status: status.as_u16(),
            message,
        })
    }
}
