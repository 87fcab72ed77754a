use axum::{
    routing::{get, post},
    Router,
};

pub mod common;
pub mod continuations;
pub mod dead_letters;
pub mod jobs;
pub mod system;

/// Router for every engine endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/stream", get(system::stream))
        .route("/continuations", post(continuations::handle_batch))
        .nest("/jobs", jobs::router())
        .nest("/dead-letters", dead_letters::router())
}
