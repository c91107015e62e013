//! SSE transport adapter for the web layer.
//!
//! Turns an HTTP request into a `Transport` for the broker, then frames
//! the resulting live client's events onto a streaming response. The broker,
//! the session registry and the message types live in the `sse` crate.

pub mod handler;
pub mod transport;
