//! Server-Sent Events (SSE) delivery with persistent, replayable sessions.
//!
//! This crate fans application events out to many long-lived streaming
//! connections and keeps a logical session alive across disconnects, so a
//! client that reconnects within the retention window receives every event it
//! missed before live delivery resumes.
//!
//! # Architecture
//!
//! - **Single-owner broker loop**: the live-client table is owned by one task;
//!   registration, release and broadcast requests reach it over channels.
//! - **Session registry**: sharded map of sessions, each behind its own lock,
//!   with a bounded ring buffer that only fills while the session is offline.
//! - **Non-blocking delivery**: full client channels drop events; clients that
//!   stay full past the slow-consumer timeout are disconnected. Producers never
//!   wait on consumers.
//! - **Transport-agnostic**: adapters implement [`Transport`] and drain
//!   [`LiveClient`]s; the HTTP framing lives in the `web` crate.
//!
//! # Message Flow
//!
//! 1. Client opens the SSE endpoint, optionally presenting a session id and
//!    the id of the last event it saw
//! 2. `Broker::register_client` reclaims the session if nobody else holds it,
//!    otherwise creates a new one
//! 3. The client receives a `connected` acknowledgement, then any replayed
//!    events, then live events
//! 4. On disconnect the adapter releases the client; the session starts
//!    buffering until it is reclaimed or expires
//!
//! # Example: Sending an event
//!
//! ```rust,ignore
//! // Everyone, including sessions that are currently offline
//! app_state.broker.broadcast("comment_added", rendered_fragment);
//!
//! // Only the named session
//! app_state.broker.send_to_client(session_id, "upload_done", r#"{"ok":true}"#);
//! ```
//!
//! # Modules
//!
//! - `broker`: event loop, heartbeat, public delivery API and stats
//! - `connection`: live-client handles and the loop-owned client table
//! - `message`: the `Event` carrier and delivery scopes
//! - `session`: session registry, ownership checks and expiry sweep
//! - `ring_buffer`: fixed-capacity circular store used for offline buffering

pub mod broker;
pub mod connection;
pub mod error;
pub mod message;
pub mod notification_handler;
pub mod ring_buffer;
pub mod session;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerStats};
pub use connection::{ClientId, LiveClient};
pub use message::{Event, Message, MessageScope, SessionId};
pub use notification_handler::NotificationHandler;
pub use session::{ClientSession, SessionConfig, SessionMetadata, SessionRegistry};
pub use transport::Transport;
