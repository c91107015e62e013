use crate::message::{Event, SessionId};
use log::*;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The transport adapter's handle on one registered connection.
///
/// Events arrive on a bounded channel fed by the broker. The broker closes the
/// client by firing its closed signal and dropping the sending half, after
/// which [`LiveClient::next_event`] returns `None`.
#[derive(Debug)]
pub struct LiveClient {
    pub id: ClientId,
    pub session_id: SessionId,
    /// True if an existing session was reclaimed rather than created
    pub reconnected: bool,
    /// Number of buffered events queued ahead of live delivery
    pub replayed: usize,
    receiver: mpsc::Receiver<Event>,
    closed: watch::Receiver<bool>,
}

impl LiveClient {
    /// Waits for the next event, or `None` once the broker has closed this client.
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.is_closed() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => None,
            event = self.receiver.recv() => event,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Outcome of offering an event to a client's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Channel full; the event was dropped for this client
    Dropped,
    /// Channel has been full for longer than the slow-consumer timeout
    Unresponsive,
    /// The receiving side is gone
    Gone,
}

impl Delivery {
    pub(crate) fn should_disconnect(self) -> bool {
        matches!(self, Delivery::Unresponsive | Delivery::Gone)
    }
}

/// Broker-side state of one live client.
#[derive(Debug)]
pub(crate) struct ClientSlot {
    pub(crate) id: ClientId,
    sender: mpsc::Sender<Event>,
    closed: watch::Sender<bool>,
    /// When the channel last filled up with no drain since
    stalled_since: Option<Instant>,
}

impl ClientSlot {
    pub(crate) fn open(
        session_id: SessionId,
        capacity: usize,
        reconnected: bool,
        replayed: usize,
    ) -> (Self, LiveClient) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);
        let id = ClientId::new();

        let slot = Self {
            id: id.clone(),
            sender,
            closed,
            stalled_since: None,
        };
        let client = LiveClient {
            id,
            session_id,
            reconnected,
            replayed,
            receiver,
            closed: closed_rx,
        };
        (slot, client)
    }

    /// Non-blocking delivery; never waits on a slow consumer.
    pub(crate) fn deliver(&mut self, event: Event, timeout: Duration) -> Delivery {
        match self.sender.try_send(event) {
            Ok(()) => {
                // The stall clock starts with the delivery that fills the channel.
                self.stalled_since = (self.sender.capacity() == 0).then(Instant::now);
                Delivery::Delivered
            }
            Err(TrySendError::Full(event)) => {
                debug!("Client {} channel full, dropping event {}", self.id, event.id);
                if self.stalled_for(timeout) {
                    Delivery::Unresponsive
                } else {
                    Delivery::Dropped
                }
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Checks a client that may not have been offered anything recently.
    pub(crate) fn is_unresponsive(&mut self, timeout: Duration) -> bool {
        if self.sender.is_closed() {
            return true;
        }
        if self.sender.capacity() > 0 {
            self.stalled_since = None;
            return false;
        }
        self.stalled_for(timeout)
    }

    /// Instant at which this client counts as unresponsive, if it is stalled.
    fn stall_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.stalled_since.map(|since| since + timeout)
    }

    fn stalled_for(&mut self, timeout: Duration) -> bool {
        let since = *self.stalled_since.get_or_insert_with(Instant::now);
        since.elapsed() >= timeout
    }

    /// Fires the closed signal; dropping `self` closes the channel.
    pub(crate) fn close(self) {
        self.closed.send_replace(true);
    }
}

/// Live-client table, owned exclusively by the broker event loop.
///
/// At most one client holds a given session id.
#[derive(Debug, Default)]
pub(crate) struct LiveClients {
    clients: HashMap<SessionId, ClientSlot>,
}

impl LiveClients {
    pub(crate) fn contains(&self, session_id: &str) -> bool {
        self.clients.contains_key(session_id)
    }

    pub(crate) fn insert(&mut self, session_id: SessionId, slot: ClientSlot) -> Option<ClientSlot> {
        self.clients.insert(session_id, slot)
    }

    /// Removes the session's client. With `client_id` given, only removes it if
    /// the ids match, so a stale release cannot evict a newer connection.
    pub(crate) fn remove(
        &mut self,
        session_id: &str,
        client_id: Option<&ClientId>,
    ) -> Option<ClientSlot> {
        let owned = match (self.clients.get(session_id), client_id) {
            (Some(slot), Some(id)) => &slot.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned {
            self.clients.remove(session_id)
        } else {
            None
        }
    }

    /// Offers `event` to one session's client. `None` if it is not live.
    pub(crate) fn send_to(
        &mut self,
        session_id: &str,
        event: &Event,
        timeout: Duration,
    ) -> Option<Delivery> {
        self.clients
            .get_mut(session_id)
            .map(|slot| slot.deliver(event.clone(), timeout))
    }

    /// Offers `event` to every client, returning the sessions that must be disconnected.
    pub(crate) fn broadcast(&mut self, event: &Event, timeout: Duration) -> Vec<SessionId> {
        self.clients
            .iter_mut()
            .filter_map(|(session_id, slot)| {
                slot.deliver(event.clone(), timeout)
                    .should_disconnect()
                    .then(|| session_id.clone())
            })
            .collect()
    }

    pub(crate) fn unresponsive(&mut self, timeout: Duration) -> Vec<SessionId> {
        self.clients
            .iter_mut()
            .filter_map(|(session_id, slot)| {
                slot.is_unresponsive(timeout).then(|| session_id.clone())
            })
            .collect()
    }

    /// Earliest moment any stalled client reaches the slow-consumer timeout.
    pub(crate) fn next_stall_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.clients
            .values()
            .filter_map(|slot| slot.stall_deadline(timeout))
            .min()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (SessionId, ClientSlot)> + '_ {
        self.clients.drain()
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }
}
