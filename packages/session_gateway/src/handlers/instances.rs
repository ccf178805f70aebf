use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use session_manager::{InstanceStatus, InstanceSummary, SessionError};

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct ListInstancesResponse {
    success: bool,
    instances: Vec<InstanceSummary>,
}

pub async fn list_instances(State(state): State<AppState>) -> Json<ListInstancesResponse> {
    let mut instances = state.manager.list_all().await;
    instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Json(ListInstancesResponse {
        success: true,
        instances,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    #[serde(default)]
    instance_id: String,
    name: Option<String>,
}

#[derive(Serialize)]
pub struct InstanceResponse {
    success: bool,
    message: String,
    instance: InstanceSummary,
}

pub async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let id = req.instance_id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("instanceId is required".into()));
    }

    let snapshot = state.manager.initialize(id, req.name.as_deref()).await?;
    Ok(Json(InstanceResponse {
        success: true,
        message: format!("Instance {} initialized", snapshot.id),
        instance: snapshot.summary(),
    }))
}

#[derive(Deserialize, Default)]
pub struct RestartRequest {
    name: Option<String>,
}

pub async fn restart_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestartRequest>>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let snapshot = state.manager.restart(&id, req.name.as_deref()).await?;
    Ok(Json(InstanceResponse {
        success: true,
        message: format!("Instance {} restarted", snapshot.id),
        instance: snapshot.summary(),
    }))
}

#[derive(Serialize)]
pub struct StatusResponse {
    success: bool,
    #[serde(flatten)]
    status: InstanceStatus,
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.manager.get_status(&id).await?;
    Ok(Json(StatusResponse {
        success: true,
        status,
    }))
}

#[derive(Serialize)]
pub struct ActionResponse {
    success: bool,
    message: String,
}

pub async fn logout_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    if !state.manager.logout(&id).await {
        return Err(SessionError::NotFound(id).into());
    }
    Ok(Json(ActionResponse {
        success: true,
        message: format!("Instance {} logged out", id),
    }))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.manager.delete(&id).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("Instance {} deleted", id),
    }))
}
