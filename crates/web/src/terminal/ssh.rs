//! SSH shells over russh

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::shell::{PtyRequest, ShellAuth, ShellConnector, ShellEvent, ShellSession, ShellTarget};
use super::BridgeError;

/// Accepts any host key.
// TODO: verify host keys against a per-profile known_hosts entry.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens interactive shells with russh
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn open(
        &self,
        target: &ShellTarget,
        pty: &PtyRequest,
    ) -> Result<Box<dyn ShellSession>, BridgeError> {
        let addr = (target.host.as_str(), target.port);
        let mut handle = client::connect(self.config.clone(), addr, AcceptAnyHostKey)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let auth = match &target.auth {
            ShellAuth::PrivateKey(pem) => {
                let key = russh::keys::decode_secret_key(pem, None)
                    .map_err(|e| BridgeError::Connect(format!("invalid private key: {}", e)))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| BridgeError::Connect(e.to_string()))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        &target.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
            }
            ShellAuth::Password(pw) => handle.authenticate_password(&target.username, pw).await,
        }
        .map_err(|e| BridgeError::Connect(e.to_string()))?;

        if !auth.success() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(BridgeError::AuthRejected(target.username.clone()));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))?;
        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))?;

        debug!("SSH shell open on {}:{}", target.host, target.port);
        Ok(Box::new(RusshSession {
            handle,
            channel,
            closed: false,
        }))
    }
}

struct RusshSession {
    handle: Handle<AcceptAnyHostKey>,
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl ShellSession for RusshSession {
    async fn write(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))
    }

    async fn next_event(&mut self) -> ShellEvent {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return ShellEvent::Stdout(data.to_vec()),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    trace!("extended data stream {}", ext);
                    return ShellEvent::Stderr(data.to_vec());
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return ShellEvent::Closed;
                }
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.channel.close().await;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        debug!("SSH session released");
    }
}
