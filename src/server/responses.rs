use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::outbound::webhook::WebhookError;

/// JSON error body shared by all API error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    error: &'static str,
    message: String,
    status: u16,
}

impl WebhookError {
    fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::DeliveryNotFound(_) | WebhookError::SubscriptionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            WebhookError::NotRetryable { .. } | WebhookError::ClaimLost(_) => StatusCode::CONFLICT,
            WebhookError::UnknownEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebhookError::Store(_) | WebhookError::HttpClient(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error: self.code(),
            message,
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
