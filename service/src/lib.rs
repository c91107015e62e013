use config::Config;
use events::EventPublisher;
use log::info;
use sse::{Broker, NotificationHandler, SessionRegistry};
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state shared by every request handler
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub broker: Arc<Broker>,
    pub event_publisher: EventPublisher,
}

impl AppState {
    pub fn new(app_config: Config, broker: &Arc<Broker>) -> Self {
        let event_publisher = EventPublisher::new()
            .with_handler(Arc::new(NotificationHandler::new(Arc::clone(broker))));

        Self {
            config: app_config,
            broker: Arc::clone(broker),
            event_publisher,
        }
    }

    /// Starts the session registry (with its expiry sweep) and the broker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(app_config: Config) -> Self {
        let session_config = app_config.session_config();
        info!(
            "SSE sessions: buffer_capacity={}, ttl={}s, sweep_interval={}s, strict_binding={}",
            session_config.buffer_capacity,
            session_config.ttl.as_secs(),
            session_config.sweep_interval.as_secs(),
            session_config.strict_binding,
        );
        let registry = SessionRegistry::start(session_config);
        let broker = Arc::new(Broker::start(app_config.broker_config(), registry));

        Self::new(app_config, &broker)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.broker.registry()
    }

    /// Closes every live client and stops the broker and sweep tasks.
    pub async fn shutdown(&self) {
        self.broker.stop().await;
        self.registry().stop().await;
        info!("SSE subsystem stopped");
    }
}
