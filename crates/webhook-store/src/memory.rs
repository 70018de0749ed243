use crate::error::StoreError;
use crate::record::{DeliveryAttemptRecord, DeliveryId, DeliveryStatus};
use crate::subscription::Subscription;
use crate::traits::{DeliveryLogStore, SubscriptionStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;

/// Process-local store backing both traits.
///
/// Claims are atomic within the process because every read-modify-write
/// happens under one lock. Use [`crate::SqliteStore`] when several processes
/// share the delivery log.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    deliveries: Arc<Mutex<HashMap<DeliveryId, DeliveryAttemptRecord>>>,
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::LockPoisoned(format!("InMemoryStore lock poisoned: {e}")))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a subscription (management-layer write).
    pub fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        lock(&self.subscriptions)?.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    /// Delete a subscription. Its delivery records are left untouched.
    pub fn remove_subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(lock(&self.subscriptions)?.remove(id))
    }

    /// Return a snapshot of all delivery records (for test assertions).
    pub fn snapshot(&self) -> Result<Vec<DeliveryAttemptRecord>, StoreError> {
        Ok(lock(&self.deliveries)?.values().cloned().collect())
    }
}

#[async_trait]
impl DeliveryLogStore for InMemoryStore {
    async fn create(&self, record: &DeliveryAttemptRecord) -> Result<(), StoreError> {
        let mut deliveries = lock(&self.deliveries)?;
        if deliveries.contains_key(&record.delivery_id) {
            return Err(StoreError::DuplicateDelivery(record.delivery_id.to_string()));
        }
        deliveries.insert(record.delivery_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &DeliveryAttemptRecord) -> Result<(), StoreError> {
        let mut deliveries = lock(&self.deliveries)?;
        match deliveries.get_mut(&record.delivery_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::DeliveryNotFound(record.delivery_id.to_string())),
        }
    }

    async fn update_claimed(
        &self,
        record: &DeliveryAttemptRecord,
        lease: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut deliveries = lock(&self.deliveries)?;
        match deliveries.get_mut(&record.delivery_id) {
            Some(existing) if existing.claimed_until == Some(lease) => {
                *existing = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::DeliveryNotFound(record.delivery_id.to_string())),
        }
    }

    async fn find_by_id(
        &self,
        id: &DeliveryId,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
        Ok(lock(&self.deliveries)?.get(id).cloned())
    }

    async fn find_due_retries(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<DeliveryAttemptRecord>, StoreError> {
        let mut due: Vec<DeliveryAttemptRecord> = lock(&self.deliveries)?
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();

        due.sort_by_key(|r| r.claimed_until.or(r.next_retry_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_subscription(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryAttemptRecord>, StoreError> {
        let mut records: Vec<DeliveryAttemptRecord> = lock(&self.deliveries)?
            .values()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect();

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn claim(
        &self,
        id: &DeliveryId,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
        let mut deliveries = lock(&self.deliveries)?;
        match deliveries.get_mut(id) {
            Some(record) if record.is_due(now) => {
                record.claim(now, lease);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn claim_failed(
        &self,
        id: &DeliveryId,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
        let mut deliveries = lock(&self.deliveries)?;
        match deliveries.get_mut(id) {
            Some(record) if record.status == DeliveryStatus::Failed => {
                record.reopen_for_manual_retry(now, lease);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(lock(&self.subscriptions)?.get(id).cloned())
    }

    async fn increment_trigger_stats(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut subscriptions = lock(&self.subscriptions)?;
        let subscription = subscriptions
            .get_mut(id)
            .ok_or_else(|| StoreError::SubscriptionNotFound(id.to_string()))?;
        subscription.trigger_count += 1;
        subscription.last_triggered_at = Some(now);
        Ok(())
    }
}
