//! Bearer-token middleware for worker-only routes

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};

use deskline_shared::WorkerId;

use crate::{error::ApiError, state::AppState};

/// Authenticated worker attached to the request extensions
#[derive(Debug, Clone)]
pub struct AuthWorker {
    pub worker_id: WorkerId,
    pub username: String,
}

/// Extract the token from an `Authorization: Bearer` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid worker token
pub async fn require_worker(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt.validate_token(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected worker token");
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthWorker {
        worker_id: claims.worker_id(),
        username: claims.username,
    });

    Ok(next.run(request).await)
}

/// Worker identity from an optional bearer token, for routes open to both parties
pub fn optional_worker(state: &AppState, headers: &HeaderMap) -> Option<WorkerId> {
    let token = bearer_token(headers)?;
    state.jwt.validate_token(token).ok().map(|claims| claims.worker_id())
}
