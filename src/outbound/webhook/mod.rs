// Webhook delivery pipeline
//
// Leaves: clock, hmac_signer, retry_policy, http_client (Dispatcher)
// Orchestration: delivery_service (DeliveryEngine), scheduler (RetryScheduler)
// Persistence lives in the webhook-store crate.

pub mod clock;
pub mod delivery_service;
pub mod error;
pub mod hmac_signer;
pub mod http_client;
pub mod retry_policy;
pub mod scheduler;
pub mod schemas;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery_service::{CLAIM_LEASE_MARGIN, DeliveryEngine, EngineConfig};
pub use error::WebhookError;
pub use hmac_signer::{HmacSigner, canonical_json};
pub use http_client::{
    DispatchResponse, Dispatcher, HttpDispatcher, MAX_BODY_SIZE, TransportError,
    TransportErrorCode,
};
pub use retry_policy::RetryPolicy;
pub use scheduler::{RetryScheduler, SUBSCRIPTION_GONE, SchedulerHandle, TickReport};
pub use schemas::{TriggerResult, WebhookPayload};
