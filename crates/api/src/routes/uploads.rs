//! Attachment uploads forwarded to the blob store

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use deskline_shared::ContentKind;

use crate::{
    blob_store::{BlobError, StoredBlob},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub kind: ContentKind,
    #[serde(default)]
    pub name: Option<String>,
}

/// Store the raw request body and return its descriptor
pub async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<StoredBlob>)> {
    let Some(blob_store) = state.blob_store.as_ref() else {
        return Err(ApiError::ServiceUnavailable);
    };

    if query.kind == ContentKind::Text {
        return Err(ApiError::Validation("kind must be image, file or voice".to_string()));
    }
    if body.is_empty() {
        return Err(ApiError::Validation("empty upload".to_string()));
    }
    if body.len() > state.config.max_upload_bytes {
        return Err(ApiError::PayloadTooLarge);
    }

    let name = query
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}-upload", query.kind));

    let stored = blob_store
        .store(body.to_vec(), query.kind, &name)
        .await
        .map_err(|e| match e {
            BlobError::Request(e) => ApiError::Upstream(e.to_string()),
            BlobError::InvalidResponse(msg) => ApiError::Upstream(msg),
        })?;

    Ok((StatusCode::CREATED, Json(stored)))
}
