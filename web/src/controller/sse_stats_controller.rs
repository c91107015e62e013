use crate::controller::ApiResponse;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service::AppState;

use log::*;

/// GET a snapshot of live SSE clients and retained sessions
pub async fn read(State(app_state): State<AppState>) -> impl IntoResponse {
    let stats = app_state.broker.stats();

    debug!("SSE stats: {:?}", stats);

    Json(ApiResponse::new(StatusCode::OK.into(), stats))
}
