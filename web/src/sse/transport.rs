use axum::extract::ConnectInfo;
use axum::http::header::{COOKIE, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, Request, Version};
use log::*;
use sse::{SessionId, SessionMetadata, Transport};
use std::net::SocketAddr;
use std::time::Duration;

/// Response (and fallback request) header mirroring the session cookie.
pub const SESSION_HEADER: &str = "x-sse-session-id";

/// Standard EventSource reconnection header.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Connection details extracted from an incoming SSE request.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    version: Version,
    session_id: Option<SessionId>,
    last_event_id: Option<String>,
    metadata: SessionMetadata,
    secure: bool,
}

impl HttpTransport {
    /// `fallback_last_event_id` is used when the `Last-Event-ID` header is absent.
    pub(crate) fn from_request<B>(
        request: &Request<B>,
        cookie_name: &str,
        fallback_last_event_id: Option<String>,
        subscriptions: Vec<String>,
    ) -> Self {
        let headers = request.headers();

        let session_id = session_from_cookie(headers, cookie_name)
            .or_else(|| header_str(headers, SESSION_HEADER).map(str::to_string));
        let last_event_id = header_str(headers, LAST_EVENT_ID_HEADER)
            .map(str::to_string)
            .or(fallback_last_event_id)
            .filter(|id| !id.is_empty());

        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());

        let secure = request.uri().scheme_str() == Some("https")
            || header_str(headers, "x-forwarded-proto")
                .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

        Self {
            version: request.version(),
            session_id,
            last_event_id,
            metadata: SessionMetadata {
                user_agent: header_str(headers, USER_AGENT.as_str()).map(str::to_string),
                remote_addr,
                subscriptions,
            },
            secure,
        }
    }

    /// `Set-Cookie` value binding the browser to `session_id`.
    pub(crate) fn session_cookie(
        &self,
        cookie_name: &str,
        session_id: &str,
        max_age: Duration,
    ) -> Option<HeaderValue> {
        let mut cookie = format!(
            "{cookie_name}={session_id}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
            max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }

        match HeaderValue::from_str(&cookie) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Unable to build SSE session cookie {cookie_name}: {e}");
                None
            }
        }
    }
}

impl Transport for HttpTransport {
    /// HTTP/1.0 and earlier have no chunked transfer encoding, so responses
    /// cannot be flushed incrementally.
    fn supports_streaming(&self) -> bool {
        self.version != Version::HTTP_09 && self.version != Version::HTTP_10
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session_id.clone()
    }

    fn last_event_id(&self) -> Option<String> {
        self.last_event_id.clone()
    }

    fn metadata(&self) -> SessionMetadata {
        self.metadata.clone()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn session_from_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<SessionId> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
