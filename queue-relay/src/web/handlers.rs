//! HTTP endpoint handlers.
//!
//! `POST /post` validates the quantity before touching the broker, then
//! publishes through the shared [`Publisher`] and reports the outcome.

use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::queue::{Message, Publisher, Quantity};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    /// Shown as the `max` hint on the form; not enforced
    pub max_messages: Option<u32>,
}

impl AppState {
    pub fn new(publisher: Publisher, max_messages: Option<u32>) -> Self {
        Self {
            publisher,
            max_messages,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Submission Form
// =============================================================================

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>queue-relay</title></head>
<body>
  <h1>queue-relay</h1>
  <form method="post" action="/post">
    <label>Message <input type="text" name="messageText" required></label>
    <label>Quantity <input type="number" name="messageQuantity" min="1"{max} value="1" required></label>
    <button type="submit">Send</button>
  </form>
</body>
</html>
"#;

/// Render the submission form.
pub async fn index(State(state): State<AppState>) -> Html<String> {
    let max = state
        .max_messages
        .map(|max| format!(" max=\"{max}\""))
        .unwrap_or_default();
    Html(INDEX_TEMPLATE.replace("{max}", &max))
}

// =============================================================================
// Message Submission
// =============================================================================

/// Form body of `POST /post`.
#[derive(Debug, Deserialize)]
pub struct PostForm {
    #[serde(default, rename = "messageText")]
    pub message_text: Option<String>,
    #[serde(default, rename = "messageQuantity")]
    pub message_quantity: Option<String>,
}

/// Response body of `POST /post`.
#[derive(Debug, Serialize)]
pub struct PostResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<u32>,
}

impl PostResponse {
    fn rejected(status: &'static str, error: String) -> (StatusCode, Json<PostResponse>) {
        (
            StatusCode::BAD_REQUEST,
            Json(PostResponse {
                status,
                error: Some(error),
                requested: None,
                succeeded: None,
            }),
        )
    }
}

/// Publish `messageQuantity` copies of `messageText`.
///
/// - 400 when a field is missing or the quantity is not a positive integer
/// - 200 when every copy was enqueued
/// - 500 when a send failed part way through
pub async fn post_message(
    State(state): State<AppState>,
    Form(form): Form<PostForm>,
) -> impl IntoResponse {
    let (Some(text), Some(raw_quantity)) = (form.message_text, form.message_quantity) else {
        warn!("post_missing_fields");
        return PostResponse::rejected(
            "invalid_request",
            "messageText and messageQuantity are required".to_string(),
        );
    };

    let quantity = match Quantity::parse(&raw_quantity) {
        Ok(quantity) => quantity,
        Err(e) => {
            warn!(quantity = %raw_quantity, error = %e, "post_invalid_quantity");
            return PostResponse::rejected("invalid_quantity", e.to_string());
        }
    };

    info!(
        body_length = text.len(),
        quantity = quantity.get(),
        "post_received"
    );

    let report = state
        .publisher
        .publish(&Message::new(text), quantity)
        .await;

    if report.is_complete() {
        return (
            StatusCode::OK,
            Json(PostResponse {
                status: "success",
                error: None,
                requested: None,
                succeeded: None,
            }),
        );
    }

    let reason = report
        .failure
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "not every message was published".to_string());

    error!(
        requested = report.requested,
        succeeded = report.succeeded,
        error = %reason,
        "post_publish_failed"
    );

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(PostResponse {
            status: "error",
            error: Some(reason),
            requested: Some(report.requested),
            succeeded: Some(report.succeeded),
        }),
    )
}
