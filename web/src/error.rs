use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use log::*;
use sse::error::{Error as SseError, ErrorKind, StoreErrorKind};

#[derive(Debug)]
pub struct Error(SseError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html#associatedconstant.UNPROCESSABLE_ENTITY
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self.0.error_kind {
            // Only the server-wide shutdown token is handed to publishers and
            // registries from request handlers.
            ErrorKind::Cancelled => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
            }
            ErrorKind::Store(store_error_kind) => {
                warn!("Connection store failure: {:?}", self.0.source);
                match store_error_kind {
                    StoreErrorKind::Unavailable => {
                        (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
                    }
                    StoreErrorKind::Transaction => {
                        (StatusCode::BAD_GATEWAY, "BAD GATEWAY").into_response()
                    }
                }
            }
            ErrorKind::Config(_) | ErrorKind::Write(_) | ErrorKind::Relay(_) => {
                error!("Unexpected error handling request: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
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
