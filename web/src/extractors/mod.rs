pub mod client_identity;

use axum::http::StatusCode;

pub type RejectionType = (StatusCode, String);
