//! Message commands and status queries against live sessions.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{Document, EngineSession, MessageReceipt, Presence};
use crate::error::{Result, SessionError};
use crate::manager::SessionManager;
use crate::record::{InstanceStatus, InstanceSummary, SessionState};

const PEER_SERVER: &str = "s.whatsapp.net";

/// Address a peer. A bare number gets the default server appended; an id
/// that already carries a server is left alone.
pub fn peer_address(number: &str) -> String {
    let number = number.trim();
    if number.contains('@') {
        number.to_string()
    } else {
        format!("{number}@{PEER_SERVER}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// `.mp4` files go out as video, everything else as an image.
    pub fn from_file_name(file_name: &str) -> Self {
        let is_mp4 = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
        if is_mp4 { Self::Video } else { Self::Image }
    }
}

pub fn document_mime_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// One document of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentPayload {
    pub data: Vec<u8>,
    pub file_name: String,
    pub caption: String,
}

enum Outgoing<'a> {
    Text(&'a str),
    Media(MediaKind, Vec<u8>, &'a str),
    Document(Document),
}

impl Outgoing<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Outgoing::Text(_) => "text",
            Outgoing::Media(MediaKind::Image, ..) => "image",
            Outgoing::Media(MediaKind::Video, ..) => "video",
            Outgoing::Document(_) => "document",
        }
    }
}

impl SessionManager {
    pub async fn send_text(&self, id: &str, number: &str, text: &str) -> Result<MessageReceipt> {
        let session = self.live_session(id).await?;
        self.deliver(id, &session, &peer_address(number), Outgoing::Text(text))
            .await
    }

    pub async fn send_media(
        &self,
        id: &str,
        number: &str,
        kind: MediaKind,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<MessageReceipt> {
        let session = self.live_session(id).await?;
        self.deliver(
            id,
            &session,
            &peer_address(number),
            Outgoing::Media(kind, data, caption),
        )
        .await
    }

    pub async fn send_document(
        &self,
        id: &str,
        number: &str,
        document: DocumentPayload,
    ) -> Result<MessageReceipt> {
        let session = self.live_session(id).await?;
        self.deliver(
            id,
            &session,
            &peer_address(number),
            Outgoing::Document(into_document(document)),
        )
        .await
    }

    /// Send documents in order, pausing between items. Stops at the first
    /// failure; receipts for documents already sent are not rolled back.
    pub async fn send_batch(
        &self,
        id: &str,
        number: &str,
        documents: Vec<DocumentPayload>,
    ) -> Result<Vec<MessageReceipt>> {
        let session = self.live_session(id).await?;
        let peer = peer_address(number);
        let total = documents.len();

        let mut receipts = Vec::with_capacity(total);
        for (index, document) in documents.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config().batch_delay).await;
            }
            let receipt = self
                .deliver(id, &session, &peer, Outgoing::Document(into_document(document)))
                .await?;
            debug!(instance = %id, item = index + 1, total, "batch item sent");
            receipts.push(receipt);
        }

        info!(instance = %id, total, "batch delivered");
        Ok(receipts)
    }

    /// Current status. Never resurrects a missing instance.
    pub async fn get_status(&self, id: &str) -> Result<InstanceStatus> {
        self.registry()
            .get(id)
            .await
            .map(|snapshot| snapshot.status())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn list_all(&self) -> Vec<InstanceSummary> {
        self.registry()
            .list()
            .await
            .iter()
            .map(|snapshot| snapshot.summary())
            .collect()
    }

    async fn live_session(&self, id: &str) -> Result<Arc<dyn EngineSession>> {
        match self.registry().live_session(id).await {
            Some((SessionState::QrLimitReached, _)) => {
                Err(SessionError::PairingCapExceeded(id.to_string()))
            }
            Some((_, Some(session))) => Ok(session),
            _ => Err(SessionError::NotInitialized(id.to_string())),
        }
    }

    async fn deliver(
        &self,
        id: &str,
        session: &Arc<dyn EngineSession>,
        peer: &str,
        outgoing: Outgoing<'_>,
    ) -> Result<MessageReceipt> {
        let kind = outgoing.kind();

        session
            .set_presence(Presence::Composing, peer)
            .await
            .map_err(|e| SessionError::transport(id, e))?;
        tokio::time::sleep(self.config().presence_delay).await;

        let sent = match outgoing {
            Outgoing::Text(text) => session.send_text(peer, text).await,
            Outgoing::Media(MediaKind::Image, data, caption) => {
                session.send_image(peer, data, caption).await
            }
            Outgoing::Media(MediaKind::Video, data, caption) => {
                session.send_video(peer, data, caption).await
            }
            Outgoing::Document(document) => session.send_document(peer, document).await,
        };

        if let Err(e) = session.set_presence(Presence::Paused, peer).await {
            warn!(instance = %id, "failed to clear composing presence: {}", e);
        }

        let receipt = sent.map_err(|e| SessionError::transport(id, e))?;
        debug!(instance = %id, kind, message_id = %receipt.id, "message sent");
        Ok(receipt)
    }
}

fn into_document(payload: DocumentPayload) -> Document {
    Document {
        mime_type: document_mime_type(&payload.file_name),
        data: payload.data,
        file_name: payload.file_name,
        caption: payload.caption,
    }
}
