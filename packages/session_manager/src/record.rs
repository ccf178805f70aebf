use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineSession;

/// Connection state of one instance.
///
/// `Initializing` marks an initialization in flight; it guards against
/// duplicate initialization and is reported externally as `connecting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Initializing,
    Connecting,
    QrReady,
    QrLimitReached,
    Connected,
    LoggedOut,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing | Self::Connecting => "connecting",
            Self::QrReady => "qr_ready",
            Self::QrLimitReached => "qr_limit_reached",
            Self::Connected => "connected",
            Self::LoggedOut => "logged_out",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self, Self::Initializing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A pairing code together with the moment it was issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingArtifact {
    pub code: String,
    pub issued_at: DateTime<Utc>,
}

/// Exclusive ownership of one live engine session.
///
/// Not `Clone`: a record owns at most one, and releasing it consumes it.
pub(crate) struct SocketHandle {
    session: Arc<dyn EngineSession>,
    generation: u64,
    cancel: CancellationToken,
}

impl SocketHandle {
    pub(crate) fn new(
        session: Arc<dyn EngineSession>,
        generation: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            generation,
            cancel,
        }
    }

    pub(crate) fn session(&self) -> Arc<dyn EngineSession> {
        self.session.clone()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop listening for events, leaving the transport open.
    pub(crate) fn detach(&self) {
        self.cancel.cancel();
    }

    /// Stop listening and close the transport.
    pub(crate) fn release(self) {
        self.detach();
        self.session.close();
    }
}

/// Registry entry for one instance.
pub struct SessionRecord {
    pub id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub pairing: Option<PairingArtifact>,
    pub pairing_attempts: u32,
    pub phone: Option<String>,
    /// Set once the pairing cap is hit; the next disconnect parks the
    /// instance in `QrLimitReached` instead of reconnecting.
    pub(crate) limit_armed: bool,
    /// Stamp of the initialization that owns this record's socket.
    pub(crate) generation: u64,
    pub(crate) socket: Option<SocketHandle>,
}

impl SessionRecord {
    pub(crate) fn new(
        id: &str,
        display_name: Option<String>,
        created_at: Option<DateTime<Utc>>,
        generation: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.unwrap_or_else(|| id.to_string()),
            created_at: created_at.unwrap_or_else(Utc::now),
            state: SessionState::Initializing,
            pairing: None,
            pairing_attempts: 0,
            phone: None,
            limit_armed: false,
            generation,
            socket: None,
        }
    }

    pub fn has_live_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            created_at: self.created_at,
            state: self.state,
            pairing: self.pairing.clone(),
            pairing_attempts: self.pairing_attempts,
            phone: self.phone.clone(),
            generation: self.generation,
            live: self.has_live_socket(),
        }
    }
}

/// Point-in-time copy of a record, safe to hold while the registry changes.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub pairing: Option<PairingArtifact>,
    pub pairing_attempts: u32,
    pub phone: Option<String>,
    pub generation: u64,
    pub live: bool,
}

impl SessionSnapshot {
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            state: self.state,
            pairing_artifact: self.pairing.as_ref().map(|p| p.code.clone()),
            pairing_issued_at: self.pairing.as_ref().map(|p| p.issued_at),
            phone_identifier: self.phone.clone(),
        }
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            name: self.display_name.clone(),
            status: self.state,
            phone_number: self.phone.clone(),
            created_at: self.created_at,
        }
    }
}

/// Status query result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub state: SessionState,
    pub pairing_artifact: Option<String>,
    pub pairing_issued_at: Option<DateTime<Utc>>,
    pub phone_identifier: Option<String>,
}

/// Public fields of a record, as listed to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub status: SessionState,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
}
