//! Customer chat endpoints: admission, history and rating

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use deskline_shared::{CustomerId, Rating, RoomId, SessionRecord};

use crate::{
    auth::optional_worker,
    broker::Admission,
    error::{ApiError, ApiResult},
    notifications::NotificationEvent,
    state::AppState,
    websocket::events::MessageEvent,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitRequest {
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
}

/// Match the caller with an available worker, or offer a callback
pub async fn admit(State(state): State<AppState>, body: Option<Json<AdmitRequest>>) -> ApiResult<Json<Admission>> {
    let Json(req) = body.unwrap_or_default();
    let admission = state.broker.admit_customer(req.customer_id).await?;
    Ok(Json(admission))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
}

/// Load a session the caller takes part in
async fn participant_session(
    state: &AppState,
    headers: &HeaderMap,
    room_id: &RoomId,
    customer_id: Option<CustomerId>,
) -> ApiResult<SessionRecord> {
    let session = state.store.get_session(room_id).await?.ok_or(ApiError::NotFound)?;

    let is_customer = customer_id == Some(session.customer_id);
    let is_worker = optional_worker(state, headers) == Some(session.worker_id);
    if !is_customer && !is_worker {
        return Err(ApiError::Unauthorized);
    }
    Ok(session)
}

/// Message history for a rejoining participant
pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<MessageEvent>>> {
    let room_id = RoomId::from(room_id.as_str());
    participant_session(&state, &headers, &room_id, query.customer_id).await?;

    let messages = state
        .store
        .list_messages(&room_id, state.broker.config().history_limit)
        .await?;

    Ok(Json(messages.iter().map(MessageEvent::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRequest {
    pub customer_id: CustomerId,
    pub rating: i16,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Customer rates a finished conversation
pub async fn rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Json(req): Json<RatingRequest>,
) -> ApiResult<(StatusCode, Json<Rating>)> {
    if !(1..=5).contains(&req.rating) {
        return Err(ApiError::Validation("rating must be between 1 and 5".to_string()));
    }

    let room_id = RoomId::from(room_id.as_str());
    let session = participant_session(&state, &headers, &room_id, Some(req.customer_id)).await?;
    if session.customer_id != req.customer_id {
        return Err(ApiError::Unauthorized);
    }
    if !session.status.is_terminal() {
        return Err(ApiError::Conflict("the conversation is still open".to_string()));
    }

    let rating = Rating {
        id: Uuid::new_v4(),
        room_id: room_id.clone(),
        worker_id: session.worker_id,
        rating: req.rating,
        comment: req
            .comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        created_at: OffsetDateTime::now_utc(),
    };
    state.store.create_rating(&rating).await?;

    tracing::info!(room_id = %room_id, worker_id = %session.worker_id, rating = rating.rating, "Session rated");
    state.notifier.notify(NotificationEvent::RatingReceived {
        room_id,
        worker_id: session.worker_id,
        rating: rating.rating,
    });

    Ok((StatusCode::CREATED, Json(rating)))
}
