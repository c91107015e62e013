use log::*;
use service::{config::Config, logging, AppState};

#[tokio::main]
async fn main() {
    let config = Config::new();
    logging::init(&config);

    info!(
        "Starting pushline [{}] with SSE session TTL {}s",
        config.runtime_env(),
        config.sse_session_ttl_secs
    );

    let app_state = AppState::start(config);

    if let Err(e) = web::init_server(app_state.clone()).await {
        error!("Failed to start the HTTP server: {e}");
        app_state.shutdown().await;
        std::process::exit(1);
    }

    app_state.shutdown().await;
}
