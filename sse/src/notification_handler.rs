use crate::message::{Event, Message, MessageScope};
use crate::Broker;
use async_trait::async_trait;
use bytes::Bytes;
use events::{EventHandler, FragmentRenderer, Notification, Payload};
use log::*;
use std::sync::Arc;

/// Forwards published notifications to the broker.
///
/// This handler is responsible for:
/// 1. Resolving the payload, rendering fragments through the templating
///    collaborator when one is configured
/// 2. Routing the resulting event to every client or to the named sessions
///
/// Producers decide the audience; this handler only translates and routes.
pub struct NotificationHandler {
    broker: Arc<Broker>,
    renderer: Option<Arc<dyn FragmentRenderer>>,
}

impl NotificationHandler {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            renderer: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn FragmentRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    fn resolve(&self, event_type: &str, payload: &Payload) -> Option<Bytes> {
        match payload {
            Payload::Raw(bytes) => Some(Bytes::copy_from_slice(bytes)),
            Payload::Fragment { template, data } => {
                let Some(renderer) = &self.renderer else {
                    warn!("No fragment renderer configured, dropping {event_type} event ({template})");
                    return None;
                };
                match renderer.render(template, data) {
                    Ok(rendered) => Some(Bytes::from(rendered)),
                    Err(e) => {
                        error!("Failed to render fragment {template} for {event_type} event: {e}");
                        None
                    }
                }
            }
        }
    }
}

fn build_event(event_id: &Option<String>, event_type: &str, payload: Bytes) -> Event {
    match event_id {
        Some(id) => Event::with_id(id.as_str(), event_type, payload),
        None => Event::new(event_type, payload),
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    async fn handle(&self, notification: &Notification) {
        match notification {
            Notification::Broadcast {
                event_type,
                event_id,
                payload,
            } => {
                let Some(payload) = self.resolve(event_type, payload) else {
                    return;
                };
                debug!("Broadcasting {event_type} event");

                self.broker.send_message(Message {
                    event: build_event(event_id, event_type, payload),
                    scope: MessageScope::Broadcast,
                });
            }

            Notification::Targeted {
                event_type,
                event_id,
                payload,
                session_ids,
            } => {
                if session_ids.is_empty() {
                    return;
                }
                let Some(payload) = self.resolve(event_type, payload) else {
                    return;
                };
                debug!(
                    "Sending {event_type} event to {} session(s)",
                    session_ids.len()
                );

                self.broker.send_message(Message {
                    event: build_event(event_id, event_type, payload),
                    scope: MessageScope::Sessions {
                        session_ids: session_ids.clone(),
                    },
                });
            }
        }
    }
}
