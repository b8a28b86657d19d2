//! Worker login

use std::time::{Duration, Instant};

use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};

use deskline_shared::{Availability, WorkerId};

use crate::{
    auth::{AuthError, AuthWorker},
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Floor on login latency so failures are not distinguishable by timing
const MIN_RESPONSE_TIME: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub worker: WorkerProfile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    pub id: WorkerId,
    pub username: String,
    pub display_name: String,
    pub availability: Availability,
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<Json<LoginResponse>> {
    let start = Instant::now();
    let result = login_inner(&state, &req).await;

    let elapsed = start.elapsed();
    if elapsed < MIN_RESPONSE_TIME {
        tokio::time::sleep(MIN_RESPONSE_TIME - elapsed).await;
    }

    result
}

async fn login_inner(state: &AppState, req: &LoginRequest) -> ApiResult<Json<LoginResponse>> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation("username and password are required".to_string()));
    }

    let worker_id = state
        .authenticator
        .authenticate(&req.username, &req.password)
        .await
        .map_err(|e| match e {
            AuthError::InvalidCredentials => ApiError::InvalidCredentials,
            AuthError::Password(e) => {
                tracing::error!(error = %e, "login: stored hash is unusable");
                ApiError::InvalidCredentials
            }
            AuthError::Store(e) => e.into(),
        })?;

    let worker = state.store.get_worker(worker_id).await?.ok_or(ApiError::InvalidCredentials)?;

    let token = state.jwt.generate_token(worker.id, &worker.username).map_err(|e| {
        tracing::error!(error = %e, "login: token generation failed");
        ApiError::Internal
    })?;

    tracing::info!(worker_id = %worker.id, "Worker logged in");

    Ok(Json(LoginResponse {
        token,
        token_type: "Bearer",
        expires_in: state.jwt.expiry_seconds(),
        worker: WorkerProfile {
            id: worker.id,
            username: worker.username,
            display_name: worker.display_name,
            availability: worker.availability,
        },
    }))
}

/// Profile of the calling worker
pub async fn me(State(state): State<AppState>, Extension(auth): Extension<AuthWorker>) -> ApiResult<Json<WorkerProfile>> {
    let worker = state.store.get_worker(auth.worker_id).await?.ok_or(ApiError::NotFound)?;

    Ok(Json(WorkerProfile {
        id: worker.id,
        username: worker.username,
        display_name: worker.display_name,
        availability: worker.availability,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::routes::{create_router, testing::call};
    use crate::state::testing::test_state;
    use axum::http::{Method, StatusCode};
    use deskline_shared::RecordStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_login_and_me() {
        let (state, store) = test_state(None);
        let hash = hash_password("correct horse battery").unwrap();
        let worker = store.create_worker("ada", "Ada Lovelace", &hash).await.unwrap();
        let app = create_router(state);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({"username": "ada", "password": "correct horse battery"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tokenType"], "Bearer");
        assert_eq!(body["worker"]["displayName"], "Ada Lovelace");

        let token = body["token"].as_str().unwrap().to_string();
        let (status, body) = call(&app, Method::GET, "/api/v1/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!(worker.id));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let (state, store) = test_state(None);
        let hash = hash_password("correct horse battery").unwrap();
        store.create_worker("ada", "Ada", &hash).await.unwrap();
        let app = create_router(state);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({"username": "ada", "password": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn test_me_requires_token() {
        let (state, _) = test_state(None);
        let app = create_router(state);

        let (status, _) = call(&app, Method::GET, "/api/v1/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, Method::GET, "/api/v1/auth/me", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "INVALID_TOKEN");
    }
}
