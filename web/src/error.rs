use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use sse::error::{
    BrokerErrorKind, Error as SseError, ErrorKind as SseErrorKind, SessionErrorKind,
    TransportErrorKind,
};

extern crate log;
use log::*;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(SseError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self.0.error_kind {
            SseErrorKind::Transport(TransportErrorKind::StreamingUnsupported) => (
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "HTTP VERSION NOT SUPPORTED",
            )
                .into_response(),
            SseErrorKind::Session(SessionErrorKind::Entropy) => {
                error!("Unable to open SSE session: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
            }
            SseErrorKind::Broker(BrokerErrorKind::ShutDown) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
            }
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<SseError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
