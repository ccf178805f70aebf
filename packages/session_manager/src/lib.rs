//! Session Manager - lifecycle management for many concurrent chat sessions
//!
//! Each instance is an independent account session with its own pairing
//! flow, reconnection policy and credential folder. The wire protocol itself
//! lives behind the [`ProtocolEngine`] trait; this crate owns everything
//! around it: the registry of instances, durable credentials, pairing-cap
//! enforcement and message commands.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use session_manager::{CredentialStore, ManagerConfig, ProtocolEngine, SessionManager};
//!
//! async fn run(engine: Arc<dyn ProtocolEngine>) {
//!     let store = CredentialStore::new("/var/lib/wagateway/auth");
//!     let manager = SessionManager::new(engine, store, ManagerConfig::default());
//!
//!     // Bring back every previously paired instance
//!     manager.resurrect().await.unwrap();
//!
//!     // Start a new one and poll until a pairing code shows up
//!     manager.initialize("sales", Some("Sales desk")).await.unwrap();
//!     let status = manager.get_status("sales").await.unwrap();
//!     if let Some(code) = status.pairing_artifact {
//!         println!("scan: {}", code);
//!     }
//!
//!     manager
//!         .send_text("sales", "51999000111", "hello")
//!         .await
//!         .unwrap();
//! }
//! ```

mod commands;
mod credentials;
mod engine;
mod error;
mod manager;
mod record;
mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use commands::{DocumentPayload, MediaKind, document_mime_type, peer_address};
pub use credentials::{
    AccountIdentity, CredentialStore, Credentials, InstanceMetadata, phone_from_account_id,
    validate_instance_id,
};
pub use engine::{
    CloseReason, Document, EVENT_CHANNEL_CAPACITY, EngineConnection, EngineError, EngineEvent,
    EngineSession, MessageReceipt, OpenRequest, Presence, ProtocolEngine,
};
pub use error::{Result, SessionError};
pub use manager::{ManagerConfig, SessionManager};
pub use record::{
    InstanceStatus, InstanceSummary, PairingArtifact, SessionRecord, SessionSnapshot,
    SessionState,
};
pub use registry::Registry;
