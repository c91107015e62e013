use ::sse::Broker;
use axum::http::header::{ACCEPT, CACHE_CONTROL, COOKIE};
use axum::http::{HeaderName, HeaderValue, Method};
use log::*;
use service::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub mod controller;
pub mod error;
pub mod router;
pub(crate) mod sse;

pub use crate::sse::transport::{LAST_EVENT_ID_HEADER, SESSION_HEADER};

pub async fn init_server(app_state: AppState) -> std::io::Result<()> {
    let host = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = app_state.config.port;
    let server_url = format!("{host}:{port}");

    let listener = TcpListener::bind(&server_url).await?;
    info!("Server starting... listening for connections on http://{server_url}");

    let cors_layer = cors_layer(&app_state.config.allowed_origins);
    let broker = Arc::clone(&app_state.broker);

    axum::serve(
        listener,
        router::define_routes(app_state)
            .layer(cors_layer)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(broker))
    .await
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let session_header = HeaderName::from_static(SESSION_HEADER);

    CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_credentials(true)
        .allow_headers([
            ACCEPT,
            CACHE_CONTROL,
            COOKIE,
            HeaderName::from_static(LAST_EVENT_ID_HEADER),
            session_header.clone(),
        ])
        .expose_headers([session_header])
        .allow_origin(
            allowed_origins
                .iter()
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(origin) => Some(origin),
                    Err(_) => {
                        warn!("Ignoring invalid CORS origin: {origin}");
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
}

/// Resolves on Ctrl-C after closing every SSE stream; open streams would
/// otherwise hold the graceful shutdown open indefinitely.
async fn shutdown_signal(broker: Arc<Broker>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, closing SSE connections");
    broker.stop().await;
}
