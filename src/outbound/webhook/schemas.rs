use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use webhook_store::{DeliveryAttemptRecord, DeliveryId, DeliveryStatus};

pub const HEADER_DELIVERY_ID: &str = "X-Delivery-Id";
pub const HEADER_ORG_ID: &str = "X-Org-Id";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// Headers the engine always sets. Subscription extra headers never override them.
pub const RESERVED_HEADERS: [&str; 6] = [
    HEADER_DELIVERY_ID,
    HEADER_ORG_ID,
    HEADER_EVENT_TYPE,
    HEADER_TIMESTAMP,
    HEADER_SIGNATURE,
    "Content-Type",
];

/// `reason` reported when `trigger` is a no-op.
pub const REASON_NOT_SUBSCRIBED: &str = "not_subscribed_or_disabled";

/// Webhook payload sent to external systems
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: String,

    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    pub organization_id: String,

    pub data: Value,
}

impl WebhookPayload {
    pub fn new(
        event: impl Into<String>,
        timestamp: OffsetDateTime,
        organization_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event: event.into(),
            timestamp,
            organization_id: organization_id.into(),
            data,
        }
    }
}

/// Outcome of `trigger` or a manual retry, as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerResult {
    pub delivered: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<DeliveryId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TriggerResult {
    /// No record was created.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            delivered: false,
            delivery_id: None,
            status: None,
            status_code: None,
            reason: Some(reason.into()),
        }
    }

    /// Summarize a record after its attempt was persisted.
    pub fn from_record(record: &DeliveryAttemptRecord) -> Self {
        Self {
            delivered: record.status == DeliveryStatus::Success,
            delivery_id: Some(record.delivery_id.clone()),
            status: Some(record.status),
            status_code: record.http_status_code,
            reason: record.error_message.clone(),
        }
    }
}
