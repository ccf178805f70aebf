use crate::engine::EngineError;

/// Errors surfaced by session manager operations.
///
/// None of these are fatal to the process; each is scoped to one instance.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No live protocol session exists for the instance.
    #[error("instance {0} is not initialized")]
    NotInitialized(String),

    #[error("instance {0} not found")]
    NotFound(String),

    /// Pairing cap was hit; only an explicit restart resumes the instance.
    #[error("instance {0} reached the pairing attempt limit; restart it to request new codes")]
    PairingCapExceeded(String),

    #[error("invalid instance id {0:?}")]
    InvalidInstanceId(String),

    #[error("credential storage failed for {id}: {source}")]
    CredentialIo {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored credentials for {id} are unreadable: {source}")]
    CredentialFormat {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("message delivery failed on {id}: {source}")]
    Transport {
        id: String,
        #[source]
        source: EngineError,
    },
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "not_initialized",
            Self::NotFound(_) => "not_found",
            Self::PairingCapExceeded(_) => "pairing_cap_exceeded",
            Self::InvalidInstanceId(_) => "invalid_instance_id",
            Self::CredentialIo { .. } => "credential_io",
            Self::CredentialFormat { .. } => "credential_format",
            Self::Transport { .. } => "protocol_transport",
        }
    }

    pub(crate) fn io(id: &str, source: std::io::Error) -> Self {
        Self::CredentialIo {
            id: id.to_string(),
            source,
        }
    }

    pub(crate) fn format(id: &str, source: serde_json::Error) -> Self {
        Self::CredentialFormat {
            id: id.to_string(),
            source,
        }
    }

    pub(crate) fn transport(id: &str, source: EngineError) -> Self {
        Self::Transport {
            id: id.to_string(),
            source,
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
