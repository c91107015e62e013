use crate::message::SessionId;
use crate::session::SessionMetadata;

/// What the broker needs to know about an incoming connection.
///
/// Implemented by transport adapters (e.g. the HTTP layer) so that the broker's
/// registration logic stays independent of any particular wire framing.
pub trait Transport {
    /// Whether the connection can flush partial writes for server push.
    fn supports_streaming(&self) -> bool;

    /// Session id presented by the client, if any.
    fn session_id(&self) -> Option<SessionId>;

    /// Id of the last event the client saw before reconnecting.
    fn last_event_id(&self) -> Option<String>;

    fn metadata(&self) -> SessionMetadata {
        SessionMetadata::default()
    }
}
