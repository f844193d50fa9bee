//! Traits for the remote connection and message sending.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{Credentials, CredentialStore, Fault, StoreError, event_hub::EventStream};

/// Connection identifier, unique per opened connection.
pub type ConnectionId = Uuid;

/// Everything a connection needs to authenticate and manage signal keys.
#[derive(Clone)]
pub struct AuthState {
    pub creds: Credentials,
    pub keys: Arc<dyn CredentialStore>,
}

/// Outbound message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text { text: String },
    Image { url: String, caption: String },
    Video { url: String, caption: String },
    Audio { url: String, ptt: bool },
}

impl OutboundMessage {
    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Audio { .. } => "audio",
        }
    }
}

/// Connection error.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Failed(Fault),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl ConnectError {
    /// Fault descriptor to feed into reconnection.
    #[must_use]
    pub fn fault(&self) -> Fault {
        match self {
            Self::Failed(fault) => fault.clone(),
            Self::Storage(e) => Fault::new().with_message(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(Fault::from_io_error(&err))
    }
}

/// Send error.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    Failed(String),
}

/// Opens authenticated connections to the remote endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection using the given auth state.
    async fn connect(&self, auth: AuthState) -> Result<Arc<dyn Connection>, ConnectError>;
}

/// A live connection to the remote endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Connection events, history first, in the order they were raised.
    fn events(&self) -> EventStream;

    /// Account id once authenticated.
    fn user_id(&self) -> Option<String>;

    /// Whether `jid` exists on the network.
    async fn jid_exists(&self, jid: &str) -> Result<bool, SendError>;

    async fn send_message(&self, jid: &str, message: OutboundMessage) -> Result<(), SendError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Sends messages over whatever connection is currently live.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn jid_exists(&self, jid: &str) -> Result<bool, SendError>;

    async fn send_message(&self, jid: &str, message: OutboundMessage) -> Result<(), SendError>;
}
