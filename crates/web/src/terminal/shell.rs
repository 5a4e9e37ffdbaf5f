//! Remote shell abstraction used by the terminal bridge

use async_trait::async_trait;
use relaygate_common::{ResolvedParams, ResolvedProfile};

use super::BridgeError;

/// Credential used to authenticate the shell session
#[derive(Clone, PartialEq, Eq)]
pub enum ShellAuth {
    PrivateKey(String),
    Password(String),
}

impl std::fmt::Debug for ShellAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrivateKey(_) => write!(f, "PrivateKey(<redacted>)"),
            Self::Password(_) => write!(f, "Password(<redacted>)"),
        }
    }
}

/// Where and how to open a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: ShellAuth,
}

impl ShellTarget {
    /// Build a target from a redeemed shell profile.
    ///
    /// A private key wins over a password when both are stored.
    pub fn from_profile(profile: &ResolvedProfile) -> Result<Self, BridgeError> {
        let ResolvedParams::Shell {
            port,
            username,
            password,
            private_key,
        } = &profile.params
        else {
            return Err(BridgeError::NotShell);
        };

        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let auth = match (non_empty(private_key), non_empty(password)) {
            (Some(key), _) => ShellAuth::PrivateKey(key),
            (None, Some(pw)) => ShellAuth::Password(pw),
            (None, None) => return Err(BridgeError::CredentialMissing),
        };

        Ok(Self {
            host: profile.ip_address.clone(),
            port: *port,
            username: username.clone(),
            auth,
        })
    }
}

/// Initial terminal geometry
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Something the remote shell produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The remote side closed the channel
    Closed,
}

/// Opens remote shells
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn open(
        &self,
        target: &ShellTarget,
        pty: &PtyRequest,
    ) -> Result<Box<dyn ShellSession>, BridgeError>;
}

/// A live interactive shell.
///
/// `next_event` must be cancel safe; the relay polls it inside `select!`.
#[async_trait]
pub trait ShellSession: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), BridgeError>;

    async fn resize(&mut self, cols: u32, rows: u32) -> Result<(), BridgeError>;

    async fn next_event(&mut self) -> ShellEvent;

    /// Tear down the channel and the underlying connection
    async fn close(&mut self);
}
