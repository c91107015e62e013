use crate::controller::{health_check_controller, sse_stats_controller};
use crate::sse::handler;
use axum::{routing::get, Router};
use service::AppState;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(sse_routes(app_state))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn sse_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/sse", get(handler::sse_handler))
        .route("/sse/stats", get(sse_stats_controller::read))
        .with_state(app_state)
}
