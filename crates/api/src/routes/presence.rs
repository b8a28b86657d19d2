//! Worker dashboard snapshot

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{
    broker::{BrokerStats, WorkerPresence},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub workers: Vec<WorkerPresence>,
    pub stats: BrokerStats,
}

pub async fn snapshot(State(state): State<AppState>) -> ApiResult<Json<PresenceResponse>> {
    let workers = state.broker.presence().snapshot().await;
    let stats = state.broker.stats().await;
    Ok(Json(PresenceResponse { workers, stats }))
}
