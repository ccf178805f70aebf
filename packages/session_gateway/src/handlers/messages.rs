use axum::{
    Json,
    extract::{Path, State},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use session_manager::{DocumentPayload, MediaKind};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Media,
    Document,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    number: String,
    #[serde(rename = "type")]
    kind: Option<MessageType>,
    message: Option<String>,
    /// Base64 payload, optionally as a `data:` URL.
    media: Option<String>,
    filename: Option<String>,
    caption: Option<String>,
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    success: bool,
    message: String,
    id: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let number = required_number(&req.number)?;
    let kind = req
        .kind
        .ok_or_else(|| ApiError::BadRequest("type is required".into()))?;
    let caption = req.caption.unwrap_or_default();

    let receipt = match kind {
        MessageType::Text => {
            let text = req
                .message
                .filter(|m| !m.is_empty())
                .ok_or_else(|| ApiError::BadRequest("message is required for text".into()))?;
            state.manager.send_text(&id, number, &text).await?
        }
        MessageType::Media => {
            let data = decode_media(req.media.as_deref())?;
            let kind = MediaKind::from_file_name(req.filename.as_deref().unwrap_or_default());
            state
                .manager
                .send_media(&id, number, kind, data, &caption)
                .await?
        }
        MessageType::Document => {
            let data = decode_media(req.media.as_deref())?;
            let file_name = req
                .filename
                .filter(|f| !f.is_empty())
                .ok_or_else(|| ApiError::BadRequest("filename is required for documents".into()))?;
            state
                .manager
                .send_document(
                    &id,
                    number,
                    DocumentPayload {
                        data,
                        file_name,
                        caption,
                    },
                )
                .await?
        }
    };

    Ok(Json(SendMessageResponse {
        success: true,
        message: "Message sent".into(),
        id: receipt.id,
    }))
}

#[derive(Deserialize)]
pub struct ReceiptFile {
    media: String,
    filename: String,
    caption: Option<String>,
}

#[derive(Deserialize)]
pub struct SendReceiptsRequest {
    #[serde(default)]
    number: String,
    #[serde(default)]
    files: Vec<ReceiptFile>,
}

#[derive(Serialize)]
pub struct SendReceiptsResponse {
    success: bool,
    message: String,
    ids: Vec<String>,
}

/// Send a batch of documents to one peer, in order.
pub async fn send_receipts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendReceiptsRequest>,
) -> Result<Json<SendReceiptsResponse>, ApiError> {
    let number = required_number(&req.number)?;
    if req.files.is_empty() {
        return Err(ApiError::BadRequest("files must not be empty".into()));
    }

    let documents = req
        .files
        .into_iter()
        .map(|file| {
            Ok(DocumentPayload {
                data: decode_media(Some(&file.media))?,
                file_name: file.filename,
                caption: file.caption.unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let receipts = state.manager.send_batch(&id, number, documents).await?;
    Ok(Json(SendReceiptsResponse {
        success: true,
        message: format!("{} documents sent", receipts.len()),
        ids: receipts.into_iter().map(|r| r.id).collect(),
    }))
}

fn required_number(number: &str) -> Result<&str, ApiError> {
    let number = number.trim();
    if number.is_empty() {
        Err(ApiError::BadRequest("number is required".into()))
    } else {
        Ok(number)
    }
}

fn decode_media(media: Option<&str>) -> Result<Vec<u8>, ApiError> {
    let media = media
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::BadRequest("media is required".into()))?;
    // Strip a `data:<mime>;base64,` prefix
    let encoded = match media.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => media,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::BadRequest(format!("media is not valid base64: {e}")))
}
