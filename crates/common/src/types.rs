//! Domain types shared by the token broker and both bridges

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USERNAME: &str = "root";
pub const DEFAULT_RDP_PORT: u16 = 3389;
pub const DEFAULT_VNC_PORT: u16 = 5900;

/// What kind of machine a server profile points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Reachable over SSH; served by the terminal bridge.
    Shell,
    /// Graphical; served by the desktop broker through the gateway.
    Desktop,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Desktop => write!(f, "desktop"),
        }
    }
}

impl std::str::FromStr for ServerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Self::Shell),
            "desktop" => Ok(Self::Desktop),
            _ => Err(format!("unknown server kind: {}", s)),
        }
    }
}

/// Remote desktop sub-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesktopProtocol {
    #[default]
    Rdp,
    Vnc,
}

impl DesktopProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Rdp => DEFAULT_RDP_PORT,
            Self::Vnc => DEFAULT_VNC_PORT,
        }
    }

    /// Gateway protocol identifier
    pub fn gateway_name(self) -> &'static str {
        match self {
            Self::Rdp => "rdp",
            Self::Vnc => "vnc",
        }
    }
}

impl std::fmt::Display for DesktopProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rdp => write!(f, "RDP"),
            Self::Vnc => write!(f, "VNC"),
        }
    }
}

impl std::str::FromStr for DesktopProtocol {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RDP" => Ok(Self::Rdp),
            "VNC" => Ok(Self::Vnc),
            _ => Err(format!("unknown desktop protocol: {}", s)),
        }
    }
}

/// Account that owns server profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: i64,
}

/// Plaintext input for creating a server profile.
///
/// Secrets are encrypted by the database layer before they are stored.
#[derive(Debug, Clone)]
pub struct NewServerProfile {
    pub name: String,
    pub kind: ServerKind,
    pub ip_address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub desktop_protocol: Option<DesktopProtocol>,
}

impl NewServerProfile {
    pub fn shell(name: &str, ip_address: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ServerKind::Shell,
            ip_address: ip_address.to_string(),
            port: None,
            username: None,
            password: None,
            private_key: None,
            desktop_protocol: None,
        }
    }

    pub fn desktop(name: &str, ip_address: &str, protocol: DesktopProtocol) -> Self {
        Self {
            name: name.to_string(),
            kind: ServerKind::Desktop,
            ip_address: ip_address.to_string(),
            port: None,
            username: None,
            password: None,
            private_key: None,
            desktop_protocol: Some(protocol),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_private_key(mut self, key: &str) -> Self {
        self.private_key = Some(key.to_string());
        self
    }
}

/// Stored server profile. Secret fields hold vault envelopes.
#[derive(Debug, Clone)]
pub struct ServerProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub kind: ServerKind,
    pub ip_address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password_enc: Option<String>,
    pub private_key_enc: Option<String>,
    pub desktop_protocol: DesktopProtocol,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted connection token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionToken {
    pub id: Uuid,
    pub token: String,
    pub server_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// Kind-specific plaintext connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedParams {
    Shell {
        port: u16,
        username: String,
        password: Option<String>,
        private_key: Option<String>,
    },
    Desktop {
        protocol: DesktopProtocol,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
}

/// Result of a successful token redemption
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub id: Uuid,
    pub name: String,
    pub kind: ServerKind,
    pub ip_address: String,
    pub params: ResolvedParams,
}

impl ResolvedProfile {
    /// Public JSON view: metadata plus kind-specific plaintext fields.
    pub fn to_public_json(&self) -> serde_json::Value {
        let mut v = serde_json::json!({
            "id": self.id,
            "name": self.name,
            "type": self.kind,
            "ipAddress": self.ip_address,
        });
        let obj = match v.as_object_mut() {
            Some(o) => o,
            None => return v,
        };
        match &self.params {
            ResolvedParams::Shell {
                port,
                username,
                password,
                private_key,
            } => {
                obj.insert("sshPort".into(), (*port).into());
                obj.insert("sshUsername".into(), username.clone().into());
                obj.insert("sshPassword".into(), password.clone().into());
                obj.insert("sshKey".into(), private_key.clone().into());
            }
            ResolvedParams::Desktop {
                protocol,
                port,
                username,
                password,
            } => {
                obj.insert("desktopType".into(), protocol.to_string().into());
                match protocol {
                    DesktopProtocol::Rdp => {
                        obj.insert("rdpPort".into(), (*port).into());
                        obj.insert("rdpUsername".into(), username.clone().into());
                        obj.insert("rdpPassword".into(), password.clone().into());
                    }
                    DesktopProtocol::Vnc => {
                        obj.insert("vncPort".into(), (*port).into());
                        obj.insert("vncPassword".into(), password.clone().into());
                    }
                }
            }
        }
        v
    }

    /// Non-secret metadata, safe for error responses.
    pub fn server_info(&self) -> serde_json::Value {
        let mut v = serde_json::json!({
            "name": self.name,
            "ipAddress": self.ip_address,
            "type": self.kind,
        });
        if let ResolvedParams::Desktop { protocol, .. } = &self.params {
            v["desktopType"] = protocol.to_string().into();
        }
        v
    }
}
