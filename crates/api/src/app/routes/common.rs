use std::str::FromStr;

use axum::{http::StatusCode, response::Response};

use crate::app::errors;

/// Run a synchronous engine call on the blocking pool.
///
/// The persistent activity store blocks on the runtime internally, so engine
/// calls must never run on an async worker thread.
pub async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(errors::join_error_to_response)
}

pub fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}
