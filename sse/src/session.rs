//! Persistent client sessions that outlive individual connections.
//!
//! A session is created on a client's first connection and survives
//! disconnects for a bounded retention window. While disconnected it collects
//! missed events in a fixed-size [`RingBuffer`]; the next connection that
//! presents its id reclaims it and receives those events as a replay.
//! Replayed events stay buffered until a later reconnect acknowledges them
//! through its `Last-Event-ID`, so a replay cut short is not lost.
//!
//! Locking is two-level: the session map is a sharded `DashMap`, and each
//! session carries its own mutex so buffer writes for unrelated sessions
//! never contend. Locks are always taken map first, session second, and are
//! never held across an `.await`.

use crate::error::Error;
use crate::message::{Event, SessionId};
use crate::ring_buffer::RingBuffer;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::*;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Number of random bytes in a session id (128 bits of entropy).
const SESSION_ID_BYTES: usize = 16;
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of events retained per disconnected session
    pub buffer_capacity: usize,
    /// How long a disconnected session is retained before it expires
    pub ttl: Duration,
    /// Period of the background expiry sweep
    pub sweep_interval: Duration,
    /// Require a matching user agent before a disconnected session may be reclaimed
    pub strict_binding: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            strict_binding: false,
        }
    }
}

/// Connection details recorded when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub subscriptions: Vec<String>,
}

/// Point-in-time view of a session handed out by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
    pub reconnect_count: u32,
    pub buffered: usize,
    pub metadata: SessionMetadata,
}

/// Mutable per-session state, guarded by its own lock.
#[derive(Debug)]
struct SessionState {
    id: SessionId,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    /// Monotonic twin of `last_seen_at`, used for expiry
    last_seen: Instant,
    active: bool,
    reconnect_count: u32,
    buffer: RingBuffer<Event>,
    /// Oldest buffer entries already handed out in a replay but not yet acknowledged
    unacknowledged: usize,
    metadata: SessionMetadata,
}

impl SessionState {
    fn new(id: SessionId, capacity: usize, metadata: SessionMetadata) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_seen_at: now,
            last_seen: Instant::now(),
            active: true,
            reconnect_count: 0,
            buffer: RingBuffer::new(capacity),
            unacknowledged: 0,
            metadata,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        !self.active && now.saturating_duration_since(self.last_seen) > ttl
    }

    fn push_missed(&mut self, event: &Event) -> Option<Event> {
        let evicted = self.buffer.push(event.clone());
        if evicted.is_some() {
            self.unacknowledged = self.unacknowledged.saturating_sub(1);
        }
        evicted
    }

    /// Trims what the client has acknowledged and returns the rest as a replay.
    ///
    /// A `last_event_id` found in the buffer acknowledges every entry up to and
    /// including it. An id that is not buffered was delivered live after the
    /// previous replay, which acknowledges that replay in full. Without an id
    /// nothing is acknowledged.
    fn take_replay(&mut self, last_event_id: Option<&str>) -> Vec<Event> {
        let acknowledged = match last_event_id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .buffer
                .iter()
                .position(|event| event.id == id)
                .map_or(self.unacknowledged, |position| position + 1),
            None => 0,
        };
        self.buffer.discard_oldest(acknowledged);
        self.unacknowledged = self.buffer.len();

        self.buffer
            .iter()
            .cloned()
            .map(Event::into_replayed)
            .collect()
    }

    fn view(&self) -> ClientSession {
        ClientSession {
            id: self.id.clone(),
            created_at: self.created_at,
            last_seen: self.last_seen_at,
            active: self.active,
            reconnect_count: self.reconnect_count,
            buffered: self.buffer.len(),
            metadata: self.metadata.clone(),
        }
    }
}

struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// All known sessions, keyed by session id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionState>>>,
    config: SessionConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionRegistry {
    /// Creates a registry without a background sweep; expiry then happens
    /// lazily on lookup or through explicit [`SessionRegistry::sweep_expired`] calls.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Creates a registry and spawns its expiry sweep on the current Tokio runtime.
    pub fn start(config: SessionConfig) -> Arc<Self> {
        let registry = Arc::new(Self::new(config));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(&registry),
            registry.config.sweep_interval,
            shutdown_rx,
        ));
        *registry.sweeper.lock() = Some(Sweeper { shutdown, handle });
        registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Allocates a new active session with an empty buffer.
    pub fn create_session(&self, metadata: SessionMetadata) -> Result<ClientSession, Error> {
        loop {
            let id = generate_session_id().inspect_err(|e| {
                error!("Failed to generate session id: {e}");
            })?;

            if let Entry::Vacant(entry) = self.sessions.entry(id.clone()) {
                let state = SessionState::new(id, self.config.buffer_capacity, metadata);
                let session = state.view();
                entry.insert(Arc::new(Mutex::new(state)));
                debug!("Created session {}", session.id);
                return Ok(session);
            }
            warn!("Session id collision, regenerating");
        }
    }

    /// Returns the session if it exists and has not expired. An expired
    /// session found here is evicted immediately.
    pub fn get_session(&self, session_id: &str) -> Option<ClientSession> {
        let state = self.lookup(session_id)?;
        let session = state.lock().view();
        Some(session)
    }

    /// Reclaims a session for a new connection.
    ///
    /// Marks the session active, bumps its reconnect counter and hands back the
    /// buffered events newer than `last_event_id`, flagged as replayed and in
    /// insertion order. An empty or absent `last_event_id` returns the whole
    /// buffer. The replayed events remain buffered until a later reconnect
    /// acknowledges them. Returns `None` if the session is unknown or expired;
    /// the caller should create a new one.
    pub fn reconnect_session(
        &self,
        session_id: &str,
        last_event_id: Option<&str>,
    ) -> Option<(ClientSession, Vec<Event>)> {
        let state = self.lookup(session_id)?;
        let mut state = state.lock();

        state.active = true;
        state.reconnect_count += 1;
        state.touch();
        let replay = state.take_replay(last_event_id);

        Some((state.view(), replay))
    }

    /// Buffers `event` for a disconnected session. No-op if the session is
    /// active or unknown.
    pub fn buffer_event(&self, session_id: &str, event: &Event) {
        let Some(state) = self.state_of(session_id) else {
            trace!("Not buffering event {} for unknown session {session_id}", event.id);
            return;
        };

        let mut state = state.lock();
        if state.active {
            return;
        }
        if let Some(evicted) = state.push_missed(event) {
            debug!(
                "Session {session_id} buffer full, evicted event {}",
                evicted.id
            );
        }
    }

    /// Buffers `event` for every disconnected session, returning how many received it.
    pub fn buffer_for_disconnected(&self, event: &Event) -> usize {
        let mut buffered = 0;
        for entry in self.sessions.iter() {
            let mut state = entry.value().lock();
            if !state.active {
                state.push_missed(event);
                buffered += 1;
            }
        }
        buffered
    }

    /// Marks a session inactive and starts its retention window. The buffer
    /// is kept.
    pub fn disconnect_session(&self, session_id: &str) {
        if let Some(state) = self.state_of(session_id) {
            let mut state = state.lock();
            state.active = false;
            state.touch();
            debug!("Session {session_id} disconnected");
        }
    }

    /// Returns true if a new connection may claim `session_id`.
    ///
    /// Fails for unknown or expired sessions and for sessions another live
    /// connection currently owns. With strict binding enabled the presenting
    /// connection's user agent must also match the one recorded at creation.
    pub fn validate_ownership(&self, session_id: &str, metadata: &SessionMetadata) -> bool {
        let Some(state) = self.state_of(session_id) else {
            return false;
        };

        let state = state.lock();
        if state.active || state.is_expired(self.config.ttl, Instant::now()) {
            return false;
        }
        !self.config.strict_binding || state.metadata.user_agent == metadata.user_agent
    }

    /// Deletes a session unconditionally. Returns true if it existed.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Removes every disconnected session whose retention window has passed.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let now = Instant::now();
        let mut removed = 0;

        self.sessions.retain(|_, state| {
            let keep = !state.lock().is_expired(ttl, now);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            info!("Session sweep removed {removed} expired session(s)");
        }
        removed
    }

    /// Total number of known sessions, live or disconnected.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions currently disconnected and buffering.
    pub fn disconnected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().lock().active)
            .count()
    }

    /// Stops the background sweep and waits for it to exit.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(());
            if let Err(e) = sweeper.handle.await {
                error!("Session sweep task failed: {e}");
            }
            info!("Session sweep stopped");
        }
    }

    fn state_of(&self, session_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Like `state_of`, but evicts and hides a session that has expired.
    fn lookup(&self, session_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        let state = self.state_of(session_id)?;
        let ttl = self.config.ttl;
        let expired = state.lock().is_expired(ttl, Instant::now());
        if expired {
            self.sessions
                .remove_if(session_id, |_, state| state.lock().is_expired(ttl, Instant::now()));
            debug!("Evicted expired session {session_id} on lookup");
            return None;
        }
        Some(state)
    }
}

fn generate_session_id() -> Result<SessionId, Error> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}

async fn sweep_loop(
    registry: Weak<SessionRegistry>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let period = period.max(MIN_SWEEP_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_expired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(capacity: usize, ttl: Duration) -> SessionConfig {
        SessionConfig {
            buffer_capacity: capacity,
            ttl,
            sweep_interval: Duration::from_secs(1),
            strict_binding: false,
        }
    }

    fn disconnected(registry: &SessionRegistry) -> ClientSession {
        let session = registry.create_session(SessionMetadata::default()).unwrap();
        registry.disconnect_session(&session.id);
        session
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn create_session_is_active_with_hex_id() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create_session(SessionMetadata::default()).unwrap();

        assert_eq!(session.id.len(), SESSION_ID_BYTES * 2);
        assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(session.active);
        assert_eq!(session.buffered, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_creates_yield_distinct_ids() {
        let registry = Arc::new(SessionRegistry::new(SessionConfig::default()));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .create_session(SessionMetadata::default())
                        .unwrap()
                        .id
                })
            })
            .collect();

        let ids: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 10);
        assert!(ids.iter().all(|id| !id.is_empty()));
        assert_eq!(registry.len(), 10);
    }

    #[test]
    fn active_sessions_do_not_buffer() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create_session(SessionMetadata::default()).unwrap();

        registry.buffer_event(&session.id, &Event::with_id("1", "update", "x"));
        assert_eq!(registry.get_session(&session.id).unwrap().buffered, 0);
    }

    #[test]
    fn buffer_event_for_unknown_session_is_noop() {
        let registry = SessionRegistry::new(SessionConfig::default());
        registry.buffer_event("missing", &Event::with_id("1", "update", "x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn reconnect_replays_most_recent_events_in_order() {
        let registry = SessionRegistry::new(config(3, Duration::from_secs(60)));
        let session = disconnected(&registry);

        for id in ["A", "B", "C", "D", "E"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }

        let (reclaimed, replay) = registry.reconnect_session(&session.id, None).unwrap();
        assert_eq!(ids(&replay), vec!["C", "D", "E"]);
        assert!(replay.iter().all(|e| e.replayed));
        assert!(reclaimed.active);
        assert_eq!(reclaimed.reconnect_count, 1);
        assert_eq!(reclaimed.buffered, 3);
    }

    #[test]
    fn interrupted_replay_resumes_after_last_delivered_event() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(60)));
        let session = disconnected(&registry);
        for id in ["A", "B", "C"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }

        let (_, replay) = registry.reconnect_session(&session.id, None).unwrap();
        assert_eq!(ids(&replay), vec!["A", "B", "C"]);

        // Only A reached the client before the connection dropped
        registry.disconnect_session(&session.id);
        let (reclaimed, replay) = registry.reconnect_session(&session.id, Some("A")).unwrap();
        assert_eq!(ids(&replay), vec!["B", "C"]);
        assert!(replay.iter().all(|e| e.replayed));
        assert_eq!(reclaimed.reconnect_count, 2);
        assert_eq!(reclaimed.buffered, 2);
    }

    #[test]
    fn live_event_after_replay_acknowledges_the_replay() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(60)));
        let session = disconnected(&registry);
        for id in ["A", "B"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }
        registry.reconnect_session(&session.id, None).unwrap();

        // L1 was delivered live after the replay, then the client dropped
        registry.disconnect_session(&session.id);
        registry.buffer_event(&session.id, &Event::with_id("C", "update", "C"));

        let (reclaimed, replay) = registry.reconnect_session(&session.id, Some("L1")).unwrap();
        assert_eq!(ids(&replay), vec!["C"]);
        assert_eq!(reclaimed.buffered, 1);
    }

    #[test]
    fn evicted_replay_entries_are_not_acknowledged_twice() {
        let registry = SessionRegistry::new(config(2, Duration::from_secs(60)));
        let session = disconnected(&registry);
        for id in ["A", "B"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }
        registry.reconnect_session(&session.id, None).unwrap();
        registry.disconnect_session(&session.id);

        // C and D push the unacknowledged A and B out of the buffer
        for id in ["C", "D"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }

        let (_, replay) = registry.reconnect_session(&session.id, Some("L1")).unwrap();
        assert_eq!(ids(&replay), vec!["C", "D"]);
    }

    #[test]
    fn reconnect_replays_exactly_capacity_events_for_larger_bursts() {
        let capacity = 5;
        let registry = SessionRegistry::new(config(capacity, Duration::from_secs(60)));
        let session = disconnected(&registry);

        let sent: Vec<String> = (0..17).map(|n| format!("{n:04}")).collect();
        for id in &sent {
            registry.buffer_event(&session.id, &Event::with_id(id.as_str(), "tick", "x"));
        }

        let (_, replay) = registry.reconnect_session(&session.id, Some("")).unwrap();
        let expected: Vec<&str> = sent[sent.len() - capacity..].iter().map(String::as_str).collect();
        assert_eq!(ids(&replay), expected);
    }

    #[test]
    fn reconnect_skips_events_up_to_last_seen() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(60)));
        let session = disconnected(&registry);
        for id in ["e1", "e2", "e3", "e4"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }

        let (_, replay) = registry.reconnect_session(&session.id, Some("e2")).unwrap();
        assert_eq!(ids(&replay), vec!["e3", "e4"]);
    }

    #[test]
    fn reconnect_with_last_buffered_id_replays_nothing() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(60)));
        let session = disconnected(&registry);
        for id in ["e1", "e2"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }

        let (_, replay) = registry.reconnect_session(&session.id, Some("e2")).unwrap();
        assert!(replay.is_empty());
    }

    #[test]
    fn reconnect_with_unbuffered_last_seen_replays_everything() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(60)));
        let session = disconnected(&registry);
        for id in ["e5", "e6"] {
            registry.buffer_event(&session.id, &Event::with_id(id, "update", id));
        }

        // e4 was delivered live before the disconnect and was never buffered
        let (_, replay) = registry.reconnect_session(&session.id, Some("e4")).unwrap();
        assert_eq!(ids(&replay), vec!["e5", "e6"]);
    }

    #[test]
    fn reconnect_unknown_session_returns_none() {
        let registry = SessionRegistry::new(SessionConfig::default());
        assert!(registry.reconnect_session("nope", None).is_none());
    }

    #[test]
    fn ownership_follows_active_flag() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = disconnected(&registry);
        let meta = SessionMetadata::default();

        assert!(registry.validate_ownership(&session.id, &meta));

        registry.reconnect_session(&session.id, None).unwrap();
        let other = SessionMetadata {
            user_agent: Some("other".to_string()),
            ..Default::default()
        };
        assert!(!registry.validate_ownership(&session.id, &other));
        assert!(!registry.validate_ownership("missing", &meta));
    }

    #[test]
    fn strict_binding_requires_matching_user_agent() {
        let registry = SessionRegistry::new(SessionConfig {
            strict_binding: true,
            ..SessionConfig::default()
        });
        let owner = SessionMetadata {
            user_agent: Some("browser/1".to_string()),
            ..Default::default()
        };
        let session = registry.create_session(owner.clone()).unwrap();
        registry.disconnect_session(&session.id);

        let stranger = SessionMetadata {
            user_agent: Some("curl/8".to_string()),
            ..Default::default()
        };
        assert!(!registry.validate_ownership(&session.id, &stranger));
        assert!(registry.validate_ownership(&session.id, &owner));
    }

    #[test]
    fn buffer_for_disconnected_skips_active_sessions() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let live = registry.create_session(SessionMetadata::default()).unwrap();
        let offline = disconnected(&registry);

        let count = registry.buffer_for_disconnected(&Event::new("news", "x"));

        assert_eq!(count, 1);
        assert_eq!(registry.get_session(&live.id).unwrap().buffered, 0);
        assert_eq!(registry.get_session(&offline.id).unwrap().buffered, 1);
        assert_eq!(registry.disconnected_count(), 1);
    }

    #[test]
    fn remove_session_deletes_unconditionally() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create_session(SessionMetadata::default()).unwrap();

        assert!(registry.remove_session(&session.id));
        assert!(!registry.remove_session(&session.id));
        assert!(registry.get_session(&session.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_evicted_lazily() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(30)));
        let session = disconnected(&registry);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(registry.get_session(&session.id).is_none());
        assert!(registry.is_empty());
        assert!(registry.reconnect_session(&session.id, None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_disconnected_sessions() {
        let registry = SessionRegistry::new(config(10, Duration::from_secs(30)));
        let live = registry.create_session(SessionMetadata::default()).unwrap();
        let stale = disconnected(&registry);

        tokio::time::advance(Duration::from_secs(20)).await;
        let fresh = disconnected(&registry);
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(registry.sweep_expired(), 0);
        assert!(registry.get_session(&stale.id).is_none());
        assert!(registry.get_session(&live.id).is_some());
        assert!(registry.get_session(&fresh.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_stopped() {
        let registry = SessionRegistry::start(SessionConfig {
            buffer_capacity: 4,
            ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(2),
            strict_binding: false,
        });
        let session = disconnected(&registry);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(registry.len(), 0, "sweep should have removed {}", session.id);

        registry.stop().await;
        registry.stop().await;
    }
}
