//! Boundary to the protocol engine.
//!
//! The engine speaks the chat network's wire protocol and owns all
//! cryptographic session setup. The manager only sees it through these two
//! traits: [`ProtocolEngine`] opens sessions, [`EngineSession`] drives one
//! open session. Lifecycle signals arrive as [`EngineEvent`]s on a bounded
//! channel handed back by [`ProtocolEngine::open`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::credentials::Credentials;

/// Suggested capacity for an engine's lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session is closed")]
    Closed,
}

/// Chat presence shown to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Composing,
    Paused,
}

/// Why a session's transport closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// Engine-specific status code, when one was reported.
    pub status_code: Option<u16>,
    pub message: String,
    /// The account was unlinked from the remote side. Stored credentials
    /// are no longer valid.
    pub logged_out: bool,
}

impl CloseReason {
    pub fn dropped(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
            logged_out: false,
        }
    }

    pub fn unlinked(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
            logged_out: true,
        }
    }
}

/// Lifecycle events emitted by an open session, in emission order.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Connecting,
    /// A fresh pairing code is ready to be scanned.
    PairingCode(String),
    /// Pairing/login completed; `account_id` is the bound account, e.g.
    /// `51999000111:7@s.whatsapp.net`.
    Open { account_id: String },
    Closed(CloseReason),
    /// Key material rotated and must be persisted.
    CredentialsUpdated(Credentials),
}

#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub instance_id: String,
    pub credentials: Credentials,
    pub version: String,
}

/// A freshly opened session and its event stream.
pub struct EngineConnection {
    pub session: Arc<dyn EngineSession>,
    pub events: mpsc::Receiver<EngineEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub data: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
    pub caption: String,
}

/// Acknowledgement of a sent message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageReceipt {
    pub id: String,
}

#[async_trait]
pub trait EngineSession: Send + Sync {
    async fn send_text(&self, peer: &str, text: &str) -> Result<MessageReceipt, EngineError>;

    async fn send_image(
        &self,
        peer: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<MessageReceipt, EngineError>;

    async fn send_video(
        &self,
        peer: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<MessageReceipt, EngineError>;

    async fn send_document(
        &self,
        peer: &str,
        document: Document,
    ) -> Result<MessageReceipt, EngineError>;

    async fn set_presence(&self, presence: Presence, peer: &str) -> Result<(), EngineError>;

    /// Unlink the account from the remote side.
    async fn logout(&self) -> Result<(), EngineError>;

    /// Close the transport. Must be idempotent.
    fn close(&self);
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Client version tag to announce when opening sessions.
    async fn latest_version(&self) -> Result<String, EngineError>;

    async fn open(&self, request: OpenRequest) -> Result<EngineConnection, EngineError>;
}
