use crate::error::StoreError;
use crate::record::{DeliveryAttemptRecord, DeliveryId};
use crate::subscription::Subscription;
use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

/// Persistent record of every delivery and its attempts.
#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    /// Persist a new record. Fails if the delivery id already exists.
    async fn create(&self, record: &DeliveryAttemptRecord) -> Result<(), StoreError>;

    /// Overwrite an existing record.
    async fn update(&self, record: &DeliveryAttemptRecord) -> Result<(), StoreError>;

    /// Overwrite a record only while `lease` is still its stored claim.
    ///
    /// Returns `false` when the claim was lost to another worker after it
    /// expired. Fails if the record does not exist.
    async fn update_claimed(
        &self,
        record: &DeliveryAttemptRecord,
        lease: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    async fn find_by_id(&self, id: &DeliveryId)
    -> Result<Option<DeliveryAttemptRecord>, StoreError>;

    /// Pending records the scheduler may claim at `now`, oldest due first.
    async fn find_due_retries(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<DeliveryAttemptRecord>, StoreError>;

    /// Records of one subscription, newest first.
    async fn list_by_subscription(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryAttemptRecord>, StoreError>;

    /// Atomically take the lease on a due pending record.
    ///
    /// Returns `None` when the record is missing, no longer due or already
    /// claimed by someone else.
    async fn claim(
        &self,
        id: &DeliveryId,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError>;

    /// Atomically reopen a `failed` record for one manual attempt.
    ///
    /// Returns `None` when the record is missing or not `failed`.
    async fn claim_failed(
        &self,
        id: &DeliveryId,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError>;
}

/// Read access to webhook subscriptions plus trigger statistics.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Subscription>, StoreError>;

    /// Increment `trigger_count` and set `last_triggered_at` in one step.
    async fn increment_trigger_stats(&self, id: &str, now: OffsetDateTime)
    -> Result<(), StoreError>;
}
