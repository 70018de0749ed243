use crate::domain::events::UnknownEvent;
use thiserror::Error;
use webhook_store::{DeliveryId, DeliveryStatus, StoreError};

/// Errors surfaced to callers of the delivery engine.
///
/// Delivery outcomes are never reported here: a rejected or timed-out
/// attempt is recorded on the delivery record and returned as a result.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Delivery store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Delivery {delivery_id} is {status}; only failed deliveries can be retried")]
    NotRetryable {
        delivery_id: DeliveryId,
        status: DeliveryStatus,
    },

    #[error("Claim on delivery {0} expired and was taken over; attempt outcome discarded")]
    ClaimLost(DeliveryId),

    #[error(transparent)]
    UnknownEvent(#[from] UnknownEvent),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

impl WebhookError {
    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "store_error",
            Self::DeliveryNotFound(_) => "delivery_not_found",
            Self::SubscriptionNotFound(_) => "subscription_not_found",
            Self::NotRetryable { .. } => "not_retryable",
            Self::ClaimLost(_) => "claim_lost",
            Self::UnknownEvent(_) => "unknown_event",
            Self::HttpClient(_) => "http_client_error",
        }
    }
}

impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient(err.to_string())
    }
}
