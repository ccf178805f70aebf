//! Loopback protocol engine for local development.
//!
//! Opens sessions that never touch the network. Paired credentials connect
//! immediately; unpaired ones publish a pairing code and wait for
//! [`LoopbackEngine::complete_pairing`], reachable over HTTP through
//! [`routes`]. Sends are logged and acknowledged with fresh message ids.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use session_manager::{
    AccountIdentity, CloseReason, Credentials, Document, EVENT_CHANNEL_CAPACITY, EngineConnection,
    EngineError, EngineEvent, EngineSession, MessageReceipt, OpenRequest, Presence,
    ProtocolEngine, SessionError,
};

use crate::error::ApiError;

pub const LOOPBACK_VERSION: &str = "loopback-1";

type SessionMap = Mutex<HashMap<String, Arc<LoopbackSession>>>;

/// Open sessions by instance id. A session removes itself when closed.
#[derive(Default)]
pub struct LoopbackEngine {
    sessions: Arc<SessionMap>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances with an open loopback session.
    pub fn open_instances(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Finish pairing for `instance_id` as if the code had been scanned by
    /// `phone`. Returns false when no session is waiting.
    pub async fn complete_pairing(&self, instance_id: &str, phone: &str) -> bool {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned();
        let Some(session) = session else {
            return false;
        };

        let account_id = format!("{phone}:1@s.whatsapp.net");
        let mut credentials = session.credentials.clone();
        credentials.me = Some(AccountIdentity {
            id: account_id.clone(),
            name: None,
        });
        session
            .emit(EngineEvent::CredentialsUpdated(credentials))
            .await
            && session.emit(EngineEvent::Open { account_id }).await
    }
}

#[async_trait]
impl ProtocolEngine for LoopbackEngine {
    async fn latest_version(&self) -> Result<String, EngineError> {
        Ok(LOOPBACK_VERSION.to_string())
    }

    async fn open(&self, request: OpenRequest) -> Result<EngineConnection, EngineError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = Arc::new(LoopbackSession {
            instance_id: request.instance_id.clone(),
            credentials: request.credentials.clone(),
            events: tx,
            closed: CancellationToken::new(),
            registry: Arc::downgrade(&self.sessions),
        });

        session.emit(EngineEvent::Connecting).await;
        match request.credentials.account_id() {
            Some(account_id) => {
                let account_id = account_id.to_string();
                session.emit(EngineEvent::Open { account_id }).await;
            }
            None => {
                let code = format!("2@{}", Uuid::new_v4().simple());
                session.emit(EngineEvent::PairingCode(code)).await;
            }
        }

        debug!(instance = %request.instance_id, version = %request.version, "loopback session opened");
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.instance_id, session.clone());

        Ok(EngineConnection {
            session,
            events: rx,
        })
    }
}

struct LoopbackSession {
    instance_id: String,
    credentials: Credentials,
    events: mpsc::Sender<EngineEvent>,
    closed: CancellationToken,
    registry: Weak<SessionMap>,
}

impl LoopbackSession {
    async fn emit(&self, event: EngineEvent) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.events.send(event).await.is_ok()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.is_cancelled() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn acknowledge(&self, peer: &str, kind: &str) -> MessageReceipt {
        let id = Uuid::new_v4().simple().to_string().to_uppercase();
        info!(instance = %self.instance_id, peer = %peer, kind, message_id = %id, "loopback delivery");
        MessageReceipt { id }
    }
}

#[async_trait]
impl EngineSession for LoopbackSession {
    async fn send_text(&self, peer: &str, _text: &str) -> Result<MessageReceipt, EngineError> {
        self.ensure_open()?;
        Ok(self.acknowledge(peer, "text"))
    }

    async fn send_image(
        &self,
        peer: &str,
        _data: Vec<u8>,
        _caption: &str,
    ) -> Result<MessageReceipt, EngineError> {
        self.ensure_open()?;
        Ok(self.acknowledge(peer, "image"))
    }

    async fn send_video(
        &self,
        peer: &str,
        _data: Vec<u8>,
        _caption: &str,
    ) -> Result<MessageReceipt, EngineError> {
        self.ensure_open()?;
        Ok(self.acknowledge(peer, "video"))
    }

    async fn send_document(
        &self,
        peer: &str,
        _document: Document,
    ) -> Result<MessageReceipt, EngineError> {
        self.ensure_open()?;
        Ok(self.acknowledge(peer, "document"))
    }

    async fn set_presence(&self, presence: Presence, peer: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        debug!(instance = %self.instance_id, peer = %peer, ?presence, "loopback presence");
        Ok(())
    }

    async fn logout(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        let _ = self
            .events
            .try_send(EngineEvent::Closed(CloseReason::unlinked("logged out")));
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
        let Some(sessions) = self.registry.upgrade() else {
            return;
        };
        let mut sessions = sessions.lock().unwrap_or_else(|e| e.into_inner());
        // A newer session for the same instance may already have replaced us
        if sessions
            .get(&self.instance_id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), self))
        {
            sessions.remove(&self.instance_id);
        }
    }
}

// =============================================================================
// Development routes
// =============================================================================

#[derive(Deserialize)]
pub struct PairRequest {
    phone: String,
}

#[derive(Serialize)]
pub struct PairResponse {
    success: bool,
    message: String,
}

/// `POST /api/instances/{id}/pair` with `{"phone": "..."}` completes pairing
/// for a waiting loopback session. Only mounted when the gateway runs the
/// loopback engine.
pub fn routes(engine: Arc<LoopbackEngine>) -> Router {
    Router::new()
        .route("/api/instances/{id}/pair", post(pair_instance))
        .with_state(engine)
}

async fn pair_instance(
    State(engine): State<Arc<LoopbackEngine>>,
    Path(id): Path<String>,
    Json(req): Json<PairRequest>,
) -> Result<Json<PairResponse>, ApiError> {
    let phone = req.phone.trim();
    if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::BadRequest("phone must be digits only".into()));
    }
    if !engine.complete_pairing(&id, phone).await {
        return Err(SessionError::NotFound(id).into());
    }
    info!(instance = %id, phone = %phone, "loopback pairing completed");
    Ok(Json(PairResponse {
        success: true,
        message: format!("Instance {id} paired with {phone}"),
    }))
}
