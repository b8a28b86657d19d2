//! Callback requests left by customers when nobody was available

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use deskline_shared::{CallbackRequest, CallbackStatus, NewCallback};

use crate::{
    auth::AuthWorker,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_FIELD_LENGTH: usize = 500;

#[derive(Debug, Deserialize)]
pub struct CreateCallbackRequest {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn required(field: &str, value: &str) -> ApiResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::Validation(format!("{} is required", field)));
    }
    if value.len() > MAX_FIELD_LENGTH {
        return Err(ApiError::Validation(format!("{} is too long", field)));
    }
    Ok(value.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().chars().take(MAX_FIELD_LENGTH).collect::<String>())
        .filter(|v| !v.is_empty())
}

/// Public: leave a callback request
pub async fn create_callback(
    State(state): State<AppState>,
    Json(req): Json<CreateCallbackRequest>,
) -> ApiResult<(StatusCode, Json<CallbackRequest>)> {
    let callback = state
        .store
        .create_callback(NewCallback {
            name: required("name", &req.name)?,
            phone: required("phone", &req.phone)?,
            email: optional(req.email),
            message: optional(req.message),
        })
        .await?;

    tracing::info!(callback_id = %callback.id, "Callback requested");
    Ok((StatusCode::CREATED, Json(callback)))
}

#[derive(Debug, Deserialize)]
pub struct ListCallbacksQuery {
    #[serde(default)]
    pub status: Option<CallbackStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Worker: callback queue, optionally filtered by status
pub async fn list_callbacks(
    State(state): State<AppState>,
    Query(query): Query<ListCallbacksQuery>,
) -> ApiResult<Json<Vec<CallbackRequest>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let callbacks = state.store.list_callbacks(query.status, limit).await?;
    Ok(Json(callbacks))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCallbackRequest {
    pub status: CallbackStatus,
}

/// Worker: move a callback along its workflow
pub async fn update_callback(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthWorker>,
    Path(callback_id): Path<Uuid>,
    Json(req): Json<UpdateCallbackRequest>,
) -> ApiResult<Json<CallbackRequest>> {
    let current = state.store.get_callback(callback_id).await?.ok_or(ApiError::NotFound)?;

    if !current.status.can_transition_to(req.status) {
        return Err(ApiError::Conflict(format!(
            "cannot move a {} callback to {}",
            current.status, req.status
        )));
    }

    if !state
        .store
        .update_callback_status(callback_id, current.status, req.status)
        .await?
    {
        tracing::warn!(callback_id = %callback_id, "Callback changed concurrently");
        return Err(ApiError::Conflict("callback was updated by someone else".to_string()));
    }

    tracing::info!(
        callback_id = %callback_id,
        worker_id = %auth.worker_id,
        from = %current.status,
        to = %req.status,
        "Callback updated"
    );

    let updated = state.store.get_callback(callback_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(updated))
}
