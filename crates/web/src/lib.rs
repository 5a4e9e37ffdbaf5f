//! Relaygate Web
//!
//! Browser-facing surface of the access broker: connection token endpoints,
//! the SSH terminal WebSocket bridge and the remote desktop gateway broker.

pub mod auth;
pub mod config;
pub mod desktop;
pub mod error;
pub mod server;
pub mod terminal;

pub use config::{GatewayConfig, SshConfig, WebConfig};
pub use desktop::{BrokerError, DesktopBroker, DesktopSession};
pub use server::{WebServer, WebServerState};
pub use terminal::{BridgeError, TerminalBridge};
