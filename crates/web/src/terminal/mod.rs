//! Terminal session bridge
//!
//! Relays an interactive SSH shell over a browser WebSocket. Each socket
//! gets a reader loop (this module), a writer task draining outgoing frames,
//! and once connected a relay task that owns the shell session. Closing
//! either end cancels the relay, which always releases the shell.

pub mod protocol;
pub mod shell;
pub mod ssh;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use relaygate_common::{Error, ServerKind, TokenBroker};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SshConfig;
use protocol::{ClientFrame, ServerFrame, Utf8Decoder};
use shell::{PtyRequest, ShellConnector, ShellEvent, ShellSession, ShellTarget};

const FRAME_BUFFER: usize = 256;
const INPUT_BUFFER: usize = 256;

/// Terminal bridge failures, reported to the browser as `error` frames
#[derive(Debug, ThisError)]
pub enum BridgeError {
    #[error(transparent)]
    Resolve(#[from] Error),

    #[error("server is not SSH-accessible")]
    NotShell,

    #[error("no SSH password or private key is configured for this server")]
    CredentialMissing,

    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication rejected for user {0}")]
    AuthRejected(String),

    #[error("SSH connection timed out")]
    Timeout,

    #[error("SSH channel error: {0}")]
    Channel(String),
}

impl BridgeError {
    /// Text safe to show in the browser
    pub fn client_message(&self) -> String {
        match self {
            Self::Resolve(Error::TokenNotFound) => "Invalid connection token".to_string(),
            Self::Resolve(Error::TokenExpired) => "Connection token has expired".to_string(),
            Self::Resolve(Error::ProfileKindMismatch { .. }) | Self::NotShell => {
                "This server is not SSH-accessible".to_string()
            }
            Self::Resolve(Error::CredentialMissing(_)) | Self::CredentialMissing => {
                "No SSH password or private key is configured for this server".to_string()
            }
            Self::Resolve(_) => "Failed to resolve connection".to_string(),
            other => other.to_string(),
        }
    }
}

/// Input forwarded to the relay task
#[derive(Debug)]
enum ShellInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
}

/// Handles to a connected shell owned by one socket
struct ActiveShell {
    input: mpsc::Sender<ShellInput>,
    relay: JoinHandle<()>,
}

/// Bridges browser sockets to remote shells
pub struct TerminalBridge {
    tokens: TokenBroker,
    connector: Arc<dyn ShellConnector>,
    ssh: SshConfig,
}

impl TerminalBridge {
    pub fn new(tokens: TokenBroker, connector: Arc<dyn ShellConnector>, ssh: SshConfig) -> Self {
        Self {
            tokens,
            connector,
            ssh,
        }
    }

    /// Drive one browser socket until either side closes
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (ws_write, mut ws_read) = socket.split();
        let (frames, frames_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);
        let writer = tokio::spawn(write_frames(ws_write, frames_rx));

        let shutdown = CancellationToken::new();
        let mut active: Option<ActiveShell> = None;

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = ws_read.next() => msg,
            };

            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(_))) => {
                    let _ = frames
                        .send(ServerFrame::error("binary frames are not supported"))
                        .await;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Terminal socket closed by client");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("Terminal socket error: {}", e);
                    break;
                }
            };

            let frame = match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = frames
                        .send(ServerFrame::error(format!("malformed frame: {}", e)))
                        .await;
                    continue;
                }
            };

            match frame {
                ClientFrame::Connect { .. } if active.is_some() => {
                    let _ = frames.send(ServerFrame::error("already connected")).await;
                }
                ClientFrame::Connect { token } => match self.connect(&token).await {
                    Ok(session) => {
                        let _ = frames
                            .send(ServerFrame::Connected {
                                message: "SSH connection established".to_string(),
                            })
                            .await;
                        active = Some(spawn_relay(session, frames.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        warn!("Terminal connect failed: {}", e);
                        let _ = frames.send(ServerFrame::error(e.client_message())).await;
                    }
                },
                ClientFrame::Input { data } => match &active {
                    Some(shell) => {
                        let input = ShellInput::Data(data.into_bytes());
                        if shell.input.send(input).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = frames.send(ServerFrame::error("not connected")).await;
                    }
                },
                ClientFrame::Resize { cols, rows } => {
                    if let Some(shell) = &active {
                        let _ = shell.input.send(ShellInput::Resize { cols, rows }).await;
                    }
                }
            }
        }

        // Release the shell whichever side ended the session.
        shutdown.cancel();
        if let Some(shell) = active.take() {
            drop(shell.input);
            if let Err(e) = shell.relay.await {
                error!("Terminal relay task failed: {}", e);
            }
        }

        drop(frames);
        let _ = writer.await;
        debug!("Terminal socket finished");
    }

    async fn connect(&self, token: &str) -> Result<Box<dyn ShellSession>, BridgeError> {
        let profile = self.tokens.redeem_for(token, ServerKind::Shell)?;
        let target = ShellTarget::from_profile(&profile)?;
        let pty = PtyRequest {
            term: self.ssh.term.clone(),
            cols: self.ssh.cols,
            rows: self.ssh.rows,
        };

        info!(
            "Opening SSH session to {}:{} as {} (server {})",
            target.host, target.port, target.username, profile.id
        );

        tokio::time::timeout(self.ssh.connect_timeout(), self.connector.open(&target, &pty))
            .await
            .map_err(|_| BridgeError::Timeout)?
    }
}

fn spawn_relay(
    session: Box<dyn ShellSession>,
    frames: mpsc::Sender<ServerFrame>,
    shutdown: CancellationToken,
) -> ActiveShell {
    let (input, input_rx) = mpsc::channel(INPUT_BUFFER);
    let relay = tokio::spawn(relay(session, input_rx, frames, shutdown));
    ActiveShell { input, relay }
}

/// Owns the shell session; runs until cancelled or the remote side closes
async fn relay(
    mut session: Box<dyn ShellSession>,
    mut input: mpsc::Receiver<ShellInput>,
    frames: mpsc::Sender<ServerFrame>,
    shutdown: CancellationToken,
) {
    let mut stdout = Utf8Decoder::default();
    let mut stderr = Utf8Decoder::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            cmd = input.recv() => match cmd {
                Some(ShellInput::Data(data)) => {
                    trace!("WS->SSH: {} bytes", data.len());
                    if let Err(e) = session.write(&data).await {
                        warn!("Shell write failed: {}", e);
                        let _ = frames.send(ServerFrame::error(e.to_string())).await;
                        break;
                    }
                }
                Some(ShellInput::Resize { cols, rows }) => {
                    if let Err(e) = session.resize(cols, rows).await {
                        debug!("Shell resize failed: {}", e);
                    }
                }
                None => break,
            },

            event = session.next_event() => match event {
                ShellEvent::Stdout(bytes) => {
                    trace!("SSH->WS: {} bytes", bytes.len());
                    let data = stdout.decode(&bytes);
                    if !data.is_empty() && frames.send(ServerFrame::Output { data }).await.is_err() {
                        break;
                    }
                }
                ShellEvent::Stderr(bytes) => {
                    let data = stderr.decode(&bytes);
                    if !data.is_empty() && frames.send(ServerFrame::stderr(data)).await.is_err() {
                        break;
                    }
                }
                ShellEvent::Closed => {
                    let rest = stdout.finish();
                    if !rest.is_empty() {
                        let _ = frames.send(ServerFrame::Output { data: rest }).await;
                    }
                    let _ = frames
                        .send(ServerFrame::Closed {
                            message: "SSH connection closed".to_string(),
                        })
                        .await;
                    info!("Remote shell closed");
                    shutdown.cancel();
                    break;
                }
            },
        }
    }

    session.close().await;
}

async fn write_frames(
    mut ws_write: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = frames.recv().await {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode terminal frame: {}", e);
                continue;
            }
        };
        if ws_write.send(Message::Text(text)).await.is_err() {
            debug!("Terminal socket write failed; dropping remaining frames");
            break;
        }
    }
    let _ = ws_write.close().await;
}
