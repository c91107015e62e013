//! Central routing engine for pushed events.
//!
//! All mutation of the live-client table happens on a single event-loop task.
//! Everyone else talks to it through channels: registrations and releases are
//! requests, broadcasts are fire-and-forget messages that are dropped (with a
//! warning) rather than blocking the producer when the intake is saturated.

use crate::connection::{ClientId, ClientSlot, LiveClient, LiveClients};
use crate::error::Error;
use crate::message::{Event, Message, MessageScope, SessionId};
use crate::session::{SessionMetadata, SessionRegistry};
use crate::transport::Transport;
use bytes::Bytes;
use log::*;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

const REGISTER_CHANNEL_CAPACITY: usize = 64;
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Outbound channel size per live client
    pub client_channel_capacity: usize,
    /// Size of the broker's broadcast intake
    pub broadcast_channel_capacity: usize,
    /// Period of the synthetic heartbeat event
    pub heartbeat_interval: Duration,
    /// How long a client's channel may stay full before it is disconnected
    pub slow_consumer_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_channel_capacity: 64,
            broadcast_channel_capacity: 1024,
            heartbeat_interval: Duration::from_secs(25),
            slow_consumer_timeout: Duration::from_secs(5),
        }
    }
}

/// Operational counters for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub live_clients: usize,
    pub total_sessions: usize,
    pub buffered_sessions: usize,
}

struct Registration {
    candidate: Option<SessionId>,
    last_event_id: Option<String>,
    metadata: SessionMetadata,
    reply: oneshot::Sender<Result<LiveClient, Error>>,
}

struct Unregistration {
    session_id: SessionId,
    /// Only unregister if this client still holds the session
    client_id: Option<ClientId>,
}

pub struct Broker {
    config: BrokerConfig,
    registry: Arc<SessionRegistry>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::UnboundedSender<Unregistration>,
    broadcast_tx: mpsc::Sender<Message>,
    live_clients: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Spawns the event loop and heartbeat tasks on the current Tokio runtime.
    pub fn start(config: BrokerConfig, registry: Arc<SessionRegistry>) -> Self {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_channel_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let live_clients = Arc::new(AtomicUsize::new(0));

        let event_loop = EventLoop {
            config: config.clone(),
            registry: Arc::clone(&registry),
            clients: LiveClients::default(),
            live_clients: Arc::clone(&live_clients),
            register_rx,
            unregister_rx,
            broadcast_rx,
            shutdown: shutdown_rx.clone(),
        };

        let tasks = vec![
            tokio::spawn(event_loop.run()),
            tokio::spawn(heartbeat(
                broadcast_tx.clone(),
                config.heartbeat_interval,
                shutdown_rx,
            )),
        ];

        info!(
            "SSE broker started: client_channel_capacity={}, broadcast_channel_capacity={}, \
             heartbeat_interval={:?}, slow_consumer_timeout={:?}",
            config.client_channel_capacity,
            config.broadcast_channel_capacity,
            config.heartbeat_interval,
            config.slow_consumer_timeout,
        );

        Self {
            config,
            registry,
            register_tx,
            unregister_tx,
            broadcast_tx,
            live_clients,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accepts a new connection.
    ///
    /// A session id presented by the transport is only honored if the registry
    /// agrees it may be reclaimed; otherwise the connection silently starts a
    /// fresh session. Reclaimed sessions get their buffered events queued on the
    /// returned client, in order and flagged as replayed, right after the
    /// `connected` acknowledgement.
    pub async fn register_client<T>(&self, transport: &T) -> Result<LiveClient, Error>
    where
        T: Transport + Sync + ?Sized,
    {
        if !transport.supports_streaming() {
            warn!("Rejecting SSE connection: transport cannot stream responses");
            return Err(Error::streaming_unsupported());
        }

        let metadata = transport.metadata();
        let candidate = transport.session_id().filter(|session_id| {
            let owned = self.registry.validate_ownership(session_id, &metadata);
            if !owned {
                debug!("Session {session_id} cannot be reclaimed, starting a new session");
            }
            owned
        });

        let (reply, response) = oneshot::channel();
        self.register_tx
            .send(Registration {
                candidate,
                last_event_id: transport.last_event_id(),
                metadata,
                reply,
            })
            .await
            .map_err(|_| Error::shut_down())?;

        response.await.map_err(|_| Error::shut_down())?
    }

    /// Sends an event to every live client and buffers it for every
    /// disconnected session.
    pub fn broadcast(&self, event_type: impl Into<String>, payload: impl Into<Bytes>) {
        self.send_message(Message {
            event: Event::new(event_type, payload),
            scope: MessageScope::Broadcast,
        });
    }

    pub fn send_to_client(
        &self,
        session_id: impl Into<SessionId>,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) {
        self.send_to_clients([session_id.into()], event_type, payload);
    }

    /// Sends an event to the named sessions, buffering for those that are disconnected.
    pub fn send_to_clients<I, S>(
        &self,
        session_ids: I,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<SessionId>,
    {
        let session_ids: Vec<SessionId> = session_ids.into_iter().map(Into::into).collect();
        if session_ids.is_empty() {
            return;
        }

        self.send_message(Message {
            event: Event::new(event_type, payload),
            scope: MessageScope::Sessions { session_ids },
        });
    }

    /// Queues a prebuilt message, e.g. one carrying a producer-supplied event id.
    /// Never waits: a saturated intake drops the message.
    pub fn send_message(&self, message: Message) {
        match self.broadcast_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    "SSE broker intake is saturated, dropping {} event {}",
                    message.event.event_type, message.event.id
                );
            }
            Err(TrySendError::Closed(message)) => {
                debug!(
                    "SSE broker is shut down, discarding {} event {}",
                    message.event.event_type, message.event.id
                );
            }
        }
    }

    /// Removes the session's live client and marks the session disconnected.
    /// Unregistering a session with no live client is a no-op.
    pub fn unregister_client(&self, session_id: &str) {
        self.request_unregister(session_id, None);
    }

    /// Like `unregister_client`, but only if `client_id` still holds the session.
    /// Transport adapters call this on exit so a stale connection cannot
    /// evict a newer one for the same session.
    pub fn release(&self, session_id: &str, client_id: &ClientId) {
        self.request_unregister(session_id, Some(client_id.clone()));
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            live_clients: self.live_clients.load(Ordering::Relaxed),
            total_sessions: self.registry.len(),
            buffered_sessions: self.registry.disconnected_count(),
        }
    }

    /// Closes every live client and waits for the background tasks to exit.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!("SSE broker task failed: {e}");
            }
        }
        info!("SSE broker stopped");
    }

    fn request_unregister(&self, session_id: &str, client_id: Option<ClientId>) {
        let request = Unregistration {
            session_id: session_id.to_string(),
            client_id,
        };
        if self.unregister_tx.send(request).is_err() {
            debug!("SSE broker is shut down, ignoring unregister for session {session_id}");
        }
    }
}

/// Sole owner of the live-client table.
struct EventLoop {
    config: BrokerConfig,
    registry: Arc<SessionRegistry>,
    clients: LiveClients,
    live_clients: Arc<AtomicUsize>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<Unregistration>,
    broadcast_rx: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let stall_deadline = self
                .clients
                .next_stall_deadline(self.config.slow_consumer_timeout);

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(request) = self.unregister_rx.recv() => {
                    if self.unregister(&request.session_id, request.client_id.as_ref()) {
                        info!("Unregistered SSE connection for session {}", request.session_id);
                    }
                }
                Some(registration) = self.register_rx.recv() => self.register(registration),
                Some(message) = self.broadcast_rx.recv() => self.dispatch(message),
                _ = sleep_until(stall_deadline.unwrap_or_else(Instant::now)),
                    if stall_deadline.is_some() => self.reap(),
            }
        }

        self.close_all();
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            candidate,
            last_event_id,
            metadata,
            reply,
        } = registration;

        let result = self.admit(candidate, last_event_id.as_deref(), metadata);
        if let Err(Ok(client)) = reply.send(result) {
            debug!(
                "Registration for session {} was abandoned by its caller",
                client.session_id
            );
            self.unregister(&client.session_id, Some(&client.id));
        }
    }

    fn admit(
        &mut self,
        candidate: Option<SessionId>,
        last_event_id: Option<&str>,
        metadata: SessionMetadata,
    ) -> Result<LiveClient, Error> {
        // Checked again here: registrations are serialized on this loop, the
        // caller's check was not.
        let reclaimed = candidate
            .filter(|session_id| {
                !self.clients.contains(session_id)
                    && self.registry.validate_ownership(session_id, &metadata)
            })
            .and_then(|session_id| self.registry.reconnect_session(&session_id, last_event_id));

        let reconnected = reclaimed.is_some();
        let (session, replay) = match reclaimed {
            Some(reclaimed) => reclaimed,
            None => (self.registry.create_session(metadata)?, Vec::new()),
        };

        let timeout = self.config.slow_consumer_timeout;
        let replayed = replay.len();
        let capacity = self.config.client_channel_capacity + replayed + 1;
        let (mut slot, client) = ClientSlot::open(session.id.clone(), capacity, reconnected, replayed);

        slot.deliver(Event::connected(&session.id, reconnected, replayed), timeout);
        for event in replay {
            slot.deliver(event, timeout);
        }

        if let Some(previous) = self.clients.insert(session.id.clone(), slot) {
            warn!("Replacing live client {} for session {}", previous.id, session.id);
            previous.close();
        }
        self.update_count();

        if reconnected {
            info!(
                "Reconnected SSE session {} (reconnect #{}, {} event(s) replayed)",
                session.id, session.reconnect_count, replayed
            );
        } else {
            info!("Registered new SSE session {}", session.id);
        }

        Ok(client)
    }

    fn dispatch(&mut self, message: Message) {
        let Message { event, scope } = message;
        let timeout = self.config.slow_consumer_timeout;

        match scope {
            MessageScope::Broadcast => {
                for session_id in self.clients.broadcast(&event, timeout) {
                    self.force_disconnect(&session_id);
                }
                self.registry.buffer_for_disconnected(&event);
            }
            MessageScope::Live => {
                for session_id in self.clients.broadcast(&event, timeout) {
                    self.force_disconnect(&session_id);
                }
            }
            MessageScope::Sessions { session_ids } => {
                for session_id in session_ids {
                    match self.clients.send_to(&session_id, &event, timeout) {
                        Some(delivery) if delivery.should_disconnect() => {
                            self.force_disconnect(&session_id);
                            self.registry.buffer_event(&session_id, &event);
                        }
                        Some(_) => {}
                        None => self.registry.buffer_event(&session_id, &event),
                    }
                }
            }
        }
    }

    fn reap(&mut self) {
        for session_id in self.clients.unresponsive(self.config.slow_consumer_timeout) {
            self.force_disconnect(&session_id);
        }
    }

    fn force_disconnect(&mut self, session_id: &str) {
        if self.unregister(session_id, None) {
            warn!("Disconnected unresponsive SSE client for session {session_id}");
        }
    }

    /// Returns true if a live client was removed.
    fn unregister(&mut self, session_id: &str, client_id: Option<&ClientId>) -> bool {
        let Some(slot) = self.clients.remove(session_id, client_id) else {
            debug!("No live SSE client to unregister for session {session_id}");
            return false;
        };

        slot.close();
        self.registry.disconnect_session(session_id);
        self.update_count();
        true
    }

    fn close_all(&mut self) {
        let closed: Vec<_> = self.clients.drain().collect();
        let count = closed.len();
        for (session_id, slot) in closed {
            slot.close();
            self.registry.disconnect_session(&session_id);
        }
        self.update_count();
        info!("SSE broker event loop exiting, closed {count} live client(s)");
    }

    fn update_count(&self) {
        self.live_clients.store(self.clients.len(), Ordering::Relaxed);
    }
}

async fn heartbeat(
    intake: mpsc::Sender<Message>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = period.max(MIN_TIMER_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let message = Message {
                    event: Event::heartbeat(),
                    scope: MessageScope::Live,
                };
                if let Err(TrySendError::Full(_)) = intake.try_send(message) {
                    warn!("SSE broker intake is saturated, skipping heartbeat");
                }
            }
        }
    }
}
