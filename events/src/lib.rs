//! Producer-facing notification seam for the real-time delivery subsystem.
//!
//! Request handlers and other producers publish [`Notification`]s without
//! knowing how (or whether) they reach connected clients. Handlers registered
//! on the [`EventPublisher`] do the routing; the `sse` crate provides the one
//! that forwards notifications to the broker.
//!
//! This crate has no dependencies on internal crates, avoiding circular
//! dependencies. Structured data is carried as serialized JSON values.

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error as StdError;
use std::sync::Arc;

/// Error returned by a [`FragmentRenderer`].
pub type RenderError = Box<dyn StdError + Send + Sync>;

/// Body of a notification, either ready to send or still to be rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes sent as-is, typically a pre-rendered HTML fragment or JSON.
    Raw(Vec<u8>),
    /// A named fragment to render with the given data before sending.
    Fragment { template: String, data: Value },
}

impl From<&str> for Payload {
    fn from(raw: &str) -> Self {
        Payload::Raw(raw.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(raw: String) -> Self {
        Payload::Raw(raw.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(raw: Vec<u8>) -> Self {
        Payload::Raw(raw)
    }
}

/// Something a producer wants pushed to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Delivered to every connected client, and kept for disconnected ones.
    Broadcast {
        event_type: String,
        /// Producer-supplied event id; generated when absent.
        event_id: Option<String>,
        payload: Payload,
    },
    /// Delivered only to the listed sessions.
    Targeted {
        event_type: String,
        event_id: Option<String>,
        payload: Payload,
        session_ids: Vec<String>,
    },
}

impl Notification {
    pub fn broadcast(event_type: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Notification::Broadcast {
            event_type: event_type.into(),
            event_id: None,
            payload: payload.into(),
        }
    }

    pub fn targeted<I, S>(
        session_ids: I,
        event_type: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Notification::Targeted {
            event_type: event_type.into(),
            event_id: None,
            payload: payload.into(),
            session_ids: session_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Attaches a producer-supplied event id.
    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        match &mut self {
            Notification::Broadcast { event_id, .. } | Notification::Targeted { event_id, .. } => {
                *event_id = Some(id.into());
            }
        }
        self
    }

    pub fn event_type(&self) -> &str {
        match self {
            Notification::Broadcast { event_type, .. }
            | Notification::Targeted { event_type, .. } => event_type,
        }
    }
}

/// Templating collaborator: renders a named markup fragment from a data mapping.
pub trait FragmentRenderer: Send + Sync {
    fn render(&self, template: &str, data: &Value) -> Result<Vec<u8>, RenderError>;
}

/// Trait for handling published notifications.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, notification: &Notification);
}

/// Publishes notifications to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Publish a notification to all registered handlers, in order.
    pub async fn publish(&self, notification: Notification) {
        for handler in self.handlers.iter() {
            handler.handle(&notification).await;
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
