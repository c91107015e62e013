use crate::error::Result;
use crate::sse::transport::{HttpTransport, SESSION_HEADER};
use async_stream::stream;
use axum::extract::{Query, Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::sse::{Event as SseFrame, Sse};
use axum::response::IntoResponse;
use log::*;
use serde::Deserialize;
use service::AppState;
use sse::{Broker, ClientId, Event, SessionId};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SseParams {
    /// Used when the browser cannot send a `Last-Event-ID` header
    last_event_id: Option<String>,
    /// Comma-separated topics recorded on the session
    topics: Option<String>,
}

/// SSE handler that establishes a long-lived connection for real-time updates.
///
/// The session id travels in a cookie (mirrored in a response header), so a
/// browser that reconnects within the retention window reclaims its session and
/// receives the events it missed before live delivery resumes.
pub(crate) async fn sse_handler(
    State(app_state): State<AppState>,
    Query(params): Query<SseParams>,
    request: Request,
) -> Result<impl IntoResponse> {
    let config = &app_state.config;
    let subscriptions = params
        .topics
        .as_deref()
        .map(|topics| {
            topics
                .split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let transport = HttpTransport::from_request(
        &request,
        &config.sse_cookie_name,
        params.last_event_id,
        subscriptions,
    );
    let client = app_state.broker.register_client(&transport).await?;

    debug!(
        "Establishing SSE stream for session {} (client {})",
        client.session_id, client.id
    );

    let mut headers = HeaderMap::new();
    if let Some(cookie) = transport.session_cookie(
        &config.sse_cookie_name,
        &client.session_id,
        config.cookie_max_age(),
    ) {
        headers.insert(SET_COOKIE, cookie);
    }
    if let Ok(value) = HeaderValue::from_str(&client.session_id) {
        headers.insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );

    let release = ReleaseOnDrop {
        broker: Arc::clone(&app_state.broker),
        session_id: client.session_id.clone(),
        client_id: client.id.clone(),
    };
    let retry = config.retry_interval();

    // Events arrive from the broker until it closes the client. When the
    // browser goes away axum drops this stream, and the guard releases the
    // session either way.
    let stream = stream! {
        let _release = release;
        let mut client = client;
        let mut retry = Some(retry);

        while let Some(event) = client.next_event().await {
            yield Ok::<_, Infallible>(frame(&event, retry.take()));
        }

        debug!("SSE stream for session {} closed by the broker", client.session_id);
    };

    Ok((headers, Sse::new(stream)))
}

/// Releases the session when the response stream is dropped.
struct ReleaseOnDrop {
    broker: Arc<Broker>,
    session_id: SessionId,
    client_id: ClientId,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        debug!("SSE connection closed for session {}, cleaning up", self.session_id);
        self.broker.release(&self.session_id, &self.client_id);
    }
}

/// Encodes one event as an SSE frame.
///
/// Control events carry no `id:` line so the browser's last event id keeps
/// pointing at application data.
fn frame(event: &Event, retry: Option<Duration>) -> SseFrame {
    let mut frame = SseFrame::default();

    if let Some(retry) = retry {
        frame = frame.retry(retry);
    }
    if event.replayed {
        frame = frame.comment("replayed");
    }
    if !event.is_control() {
        if is_field_safe(&event.id) {
            frame = frame.id(&event.id);
        } else {
            warn!("Omitting unsafe SSE id for {} event", event.event_type);
        }
    }
    if is_field_safe(&event.event_type) {
        frame = frame.event(&event.event_type);
    } else {
        warn!("Omitting unsafe SSE event type on event {}", event.id);
    }

    frame.data(normalize_line_endings(&event.payload_str()))
}

fn is_field_safe(value: &str) -> bool {
    !value.contains(|c: char| matches!(c, '\r' | '\n' | '\0'))
}

/// `data:` lines are split on `\n`; bare carriage returns would end a line early.
fn normalize_line_endings(payload: &str) -> String {
    payload.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::define_routes;
    use axum::body::Body;
    use axum::http::header::{CONTENT_TYPE, COOKIE};
    use axum::http::{Request, StatusCode, Version};
    use axum::Router;
    use clap::Parser;
    use http_body_util::BodyExt;
    use service::config::Config;
    use tower::ServiceExt;

    fn app() -> (AppState, Router) {
        let app_state = AppState::start(Config::parse_from([
            "pushline",
            "--sse-heartbeat-interval-secs",
            "3600",
        ]));
        let router = define_routes(app_state.clone());
        (app_state, router)
    }

    async fn next_frame(body: &mut Body) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("frame before timeout")
            .expect("stream still open")
            .expect("readable frame");
        let data = frame.into_data().expect("data frame");
        String::from_utf8(data.to_vec()).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    fn session_header(response: &axum::response::Response) -> String {
        response.headers()[SESSION_HEADER].to_str().unwrap().to_string()
    }

    #[test]
    fn field_safety_rejects_line_breaks() {
        assert!(is_field_safe("evt-1"));
        assert!(!is_field_safe("evt\n1"));
        assert!(!is_field_safe("evt\r1"));
        assert!(!is_field_safe("evt\01"));
    }

    #[test]
    fn line_endings_are_normalized() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[tokio::test]
    async fn new_connection_gets_cookie_and_connected_frame() {
        let (app_state, router) = app();

        let response = router
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        let session_id = session_header(&response);
        assert_eq!(session_id.len(), 32);
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("sse_session={session_id};")));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        let max_age: u64 = cookie
            .split("; ")
            .find_map(|attribute| attribute.strip_prefix("Max-Age="))
            .and_then(|secs| secs.parse().ok())
            .unwrap();
        assert!(max_age > app_state.config.session_ttl().as_secs());

        let mut body = response.into_body();
        let ack = next_frame(&mut body).await;
        assert!(ack.contains("retry:"));
        assert!(ack.contains("event: connected"));
        assert!(ack.contains(&session_id));
        assert!(!ack.contains("id: "));

        app_state.broker.broadcast("note_saved", "<li>hello</li>");
        let live = next_frame(&mut body).await;
        assert!(live.contains("event: note_saved"));
        assert!(live.contains("data: <li>hello</li>"));
        assert!(live.contains("id: "));
        assert!(!live.contains("retry:"));

        drop(body);
        wait_until(|| app_state.broker.stats().live_clients == 0).await;
        app_state.shutdown().await;
    }

    #[tokio::test]
    async fn http_10_is_rejected() {
        let (app_state, router) = app();

        let response = router
            .oneshot(
                Request::get("/sse")
                    .version(Version::HTTP_10)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        assert_eq!(app_state.registry().len(), 0);
        app_state.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_with_cookie_replays_missed_events() {
        let (app_state, router) = app();

        let response = router
            .clone()
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let session_id = session_header(&response);
        let mut body = response.into_body();
        next_frame(&mut body).await;
        drop(body);

        let registry = app_state.registry().clone();
        wait_until(|| {
            registry
                .get_session(&session_id)
                .is_some_and(|session| !session.active)
        })
        .await;

        app_state.broker.broadcast("note_saved", "B");
        app_state.broker.broadcast("note_saved", "C");
        wait_until(|| {
            registry
                .get_session(&session_id)
                .is_some_and(|session| session.buffered == 2)
        })
        .await;

        let response = router
            .oneshot(
                Request::get("/sse")
                    .header(COOKIE, format!("sse_session={session_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(session_header(&response), session_id);

        let mut body = response.into_body();
        let ack = next_frame(&mut body).await;
        assert!(ack.contains("\"reconnected\":true"));
        assert!(ack.contains("\"replayed\":2"));

        let first = next_frame(&mut body).await;
        assert!(first.contains(": replayed"));
        assert!(first.contains("data: B"));
        let second = next_frame(&mut body).await;
        assert!(second.contains(": replayed"));
        assert!(second.contains("data: C"));

        app_state.shutdown().await;
    }

    #[tokio::test]
    async fn active_session_cannot_be_claimed_by_another_connection() {
        let (app_state, router) = app();

        let first = router
            .clone()
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let owner = session_header(&first);

        let second = router
            .oneshot(
                Request::get("/sse")
                    .header(SESSION_HEADER, owner.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(second.status(), StatusCode::OK);
        assert_ne!(session_header(&second), owner);
        assert_eq!(app_state.broker.stats().live_clients, 2);

        drop(first);
        drop(second);
        app_state.shutdown().await;
    }

    #[tokio::test]
    async fn stream_ends_when_broker_stops() {
        let (app_state, router) = app();

        let response = router
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut body = response.into_body();
        next_frame(&mut body).await;

        app_state.shutdown().await;

        let end = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("stream finished before timeout");
        assert!(end.is_none());
    }
}
