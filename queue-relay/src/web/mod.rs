//! Web server module.
//!
//! The producer serves the submission form and `POST /post`; the consumer
//! only serves `/health`. Both routers carry the HTTP trace layer.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{health, index, post_message, AppState, HealthResponse, PostForm, PostResponse};

/// Routes for the producer process.
pub fn producer_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/post", post(post_message))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Routes for the consumer process.
pub fn consumer_router() -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}
