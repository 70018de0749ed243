use crate::config::WebhooksConfig;
use crate::outbound::webhook::clock::Clock;
use crate::outbound::webhook::error::WebhookError;
use crate::outbound::webhook::hmac_signer::{HmacSigner, canonical_json};
use crate::outbound::webhook::http_client::Dispatcher;
use crate::outbound::webhook::retry_policy::RetryPolicy;
use crate::outbound::webhook::schemas::{
    HEADER_DELIVERY_ID, HEADER_EVENT_TYPE, HEADER_ORG_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP,
    REASON_NOT_SUBSCRIBED, RESERVED_HEADERS, TriggerResult, WebhookPayload,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, error, info, warn};
use webhook_store::{
    DEFAULT_MAX_ATTEMPTS, DeliveryAttemptRecord, DeliveryId, DeliveryLogStore, DeliveryStatus,
    StoreError, Subscription, SubscriptionStore,
};

/// Minimum slack between the dispatch timeout and the claim lease.
pub const CLAIM_LEASE_MARGIN: Duration = Duration::from_secs(10);

/// Tunables of the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Hard bound on one HTTP attempt.
    pub dispatch_timeout: Duration,

    /// Attempts per delivery, first one included.
    pub max_attempts: u32,

    /// How long an attempt owns its record before the scheduler may take it over.
    pub claim_lease: Duration,

    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            claim_lease: Duration::from_secs(120),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl From<&WebhooksConfig> for EngineConfig {
    fn from(config: &WebhooksConfig) -> Self {
        Self {
            dispatch_timeout: config.dispatch_timeout(),
            max_attempts: config.max_attempts.max(1),
            claim_lease: config.claim_lease(),
            retry_policy: RetryPolicy::new(
                Duration::from_secs(config.retry_base_delay_secs),
                Duration::from_secs(config.retry_max_delay_secs),
            ),
        }
    }
}

/// Orchestrates webhook deliveries: signs, persists, dispatches and decides
/// what happens after each attempt.
///
/// Every attempt outcome, retryable or not, is written to the delivery log
/// and returned as a value. Only infrastructure failures surface as
/// [`WebhookError`].
pub struct DeliveryEngine {
    deliveries: Arc<dyn DeliveryLogStore>,

    subscriptions: Arc<dyn SubscriptionStore>,

    dispatcher: Arc<dyn Dispatcher>,

    clock: Arc<dyn Clock>,

    config: EngineConfig,
}

impl DeliveryEngine {
    pub fn new(
        deliveries: Arc<dyn DeliveryLogStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        mut config: EngineConfig,
    ) -> Self {
        let min_lease = config.dispatch_timeout + CLAIM_LEASE_MARGIN;
        if config.claim_lease < min_lease {
            warn!(
                claim_lease = ?config.claim_lease,
                dispatch_timeout = ?config.dispatch_timeout,
                raised_to = ?min_lease,
                "Claim lease does not outlast the dispatch timeout, raising it"
            );
            config.claim_lease = min_lease;
        }

        Self {
            deliveries,
            subscriptions,
            dispatcher,
            clock,
            config,
        }
    }

    pub fn deliveries(&self) -> &Arc<dyn DeliveryLogStore> {
        &self.deliveries
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Deliver `event_type` with `data` to `subscription`.
    ///
    /// Disabled or non-matching subscriptions are a silent no-op: no record
    /// is created. Otherwise the first attempt runs before this returns.
    pub async fn trigger<T>(
        &self,
        subscription: &Subscription,
        event_type: &str,
        data: &T,
    ) -> Result<TriggerResult, WebhookError>
    where
        T: Serialize + ?Sized + Sync,
    {
        if !subscription.is_subscribed(event_type) {
            debug!(
                subscription_id = %subscription.id,
                event_type = %event_type,
                enabled = subscription.enabled,
                "Subscription not interested in event, skipping"
            );
            return Ok(TriggerResult::skipped(REASON_NOT_SUBSCRIBED));
        }

        let now = self.clock.now();
        let delivery_id = DeliveryId::generate();

        let (body, headers) =
            match build_request(subscription, &delivery_id, event_type, data, now) {
                Ok(request) => request,
                Err(fault) => {
                    return self
                        .record_serialization_fault(subscription, delivery_id, event_type, fault, now)
                        .await;
                }
            };

        let record = DeliveryAttemptRecord::pending(
            subscription,
            event_type,
            body,
            headers,
            self.config.max_attempts,
            now,
            self.config.claim_lease,
        )
        .with_delivery_id(delivery_id);
        self.deliveries.create(&record).await?;

        info!(
            delivery_id = %record.delivery_id,
            subscription_id = %subscription.id,
            organization_id = %subscription.organization_id,
            event_type = %event_type,
            "Webhook delivery created"
        );

        let record = self.attempt(record, subscription).await?;
        Ok(TriggerResult::from_record(&record))
    }

    /// Run one attempt of a claimed record and persist the outcome.
    ///
    /// On success the subscription's trigger statistics are bumped. On
    /// failure the record is either rescheduled with backoff or, once
    /// attempts are exhausted, marked `failed`.
    pub async fn attempt(
        &self,
        mut record: DeliveryAttemptRecord,
        subscription: &Subscription,
    ) -> Result<DeliveryAttemptRecord, WebhookError> {
        let lease = record.claimed_until;
        let outcome = self
            .dispatcher
            .send(
                &record.target_url,
                &record.request_headers,
                &record.payload,
                self.config.dispatch_timeout,
            )
            .await;
        let now = self.clock.now();

        match outcome {
            Ok(response) if response.is_success() => {
                record.record_response(
                    Some(response.status_code),
                    Some(response.body),
                    None,
                    Some(response.elapsed_ms),
                );
                record.mark_success(now);
                self.write_claimed(&record, lease).await?;

                info!(
                    delivery_id = %record.delivery_id,
                    subscription_id = %record.subscription_id,
                    attempt_number = record.attempt_number,
                    status_code = response.status_code,
                    response_time_ms = response.elapsed_ms,
                    "Webhook delivered successfully"
                );

                match self
                    .subscriptions
                    .increment_trigger_stats(&subscription.id, now)
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::SubscriptionNotFound(id)) => {
                        warn!(subscription_id = %id, "Subscription removed during delivery, stats not updated");
                    }
                    Err(e) => return Err(e.into()),
                }
                return Ok(record);
            }
            Ok(response) => {
                let message = format!("HTTP {}", response.status_code);
                record.record_response(
                    Some(response.status_code),
                    Some(response.body),
                    Some(message),
                    Some(response.elapsed_ms),
                );
            }
            Err(e) => {
                record.record_response(None, None, Some(e.to_string()), None);
            }
        }

        self.settle_failure(&mut record, now);
        self.write_claimed(&record, lease).await?;
        Ok(record)
    }

    /// Persist `record` as long as `lease` is still the claim on it.
    ///
    /// A worker whose lease expired mid-attempt gets [`WebhookError::ClaimLost`]
    /// and must drop its outcome: the record now belongs to whoever took it over.
    pub(crate) async fn write_claimed(
        &self,
        record: &DeliveryAttemptRecord,
        lease: Option<OffsetDateTime>,
    ) -> Result<(), WebhookError> {
        let Some(lease) = lease else {
            self.deliveries.update(record).await?;
            return Ok(());
        };
        if self.deliveries.update_claimed(record, lease).await? {
            return Ok(());
        }
        warn!(
            delivery_id = %record.delivery_id,
            attempt_number = record.attempt_number,
            "Delivery claim lost during attempt, outcome discarded"
        );
        Err(WebhookError::ClaimLost(record.delivery_id.clone()))
    }

    /// Manually retry a `failed` delivery once, outside the schedule.
    ///
    /// The extra attempt raises `max_attempts` just enough to fit, so a
    /// failure leaves the record `failed` again.
    pub async fn retry_now(&self, delivery_id: &DeliveryId) -> Result<TriggerResult, WebhookError> {
        let record = self
            .deliveries
            .find_by_id(delivery_id)
            .await?
            .ok_or_else(|| WebhookError::DeliveryNotFound(delivery_id.clone()))?;

        if record.status != DeliveryStatus::Failed {
            return Err(WebhookError::NotRetryable {
                delivery_id: delivery_id.clone(),
                status: record.status,
            });
        }

        let subscription = self
            .subscriptions
            .get_by_id(&record.subscription_id)
            .await?
            .ok_or_else(|| WebhookError::SubscriptionNotFound(record.subscription_id.clone()))?;
        if !subscription.enabled {
            debug!(
                delivery_id = %delivery_id,
                subscription_id = %subscription.id,
                "Subscription disabled, manual retry skipped"
            );
            let mut result = TriggerResult::skipped(REASON_NOT_SUBSCRIBED);
            result.delivery_id = Some(delivery_id.clone());
            result.status = Some(record.status);
            return Ok(result);
        }

        let now = self.clock.now();
        let Some(claimed) = self
            .deliveries
            .claim_failed(delivery_id, now, self.config.claim_lease)
            .await?
        else {
            // Another manual retry won the claim.
            let status = self
                .deliveries
                .find_by_id(delivery_id)
                .await?
                .map_or(DeliveryStatus::Pending, |r| r.status);
            return Err(WebhookError::NotRetryable {
                delivery_id: delivery_id.clone(),
                status,
            });
        };

        info!(
            delivery_id = %delivery_id,
            subscription_id = %subscription.id,
            attempt_number = claimed.attempt_number,
            "Manual webhook retry"
        );

        let record = self.attempt(claimed, &subscription).await?;
        Ok(TriggerResult::from_record(&record))
    }

    fn settle_failure(&self, record: &mut DeliveryAttemptRecord, now: OffsetDateTime) {
        let policy = &self.config.retry_policy;

        if policy.is_exhausted(record.attempt_number, record.max_attempts) {
            record.mark_failed(now);
            error!(
                delivery_id = %record.delivery_id,
                subscription_id = %record.subscription_id,
                attempt_number = record.attempt_number,
                error = ?record.error_message,
                "Webhook delivery permanently failed"
            );
        } else {
            let delay = policy.next_delay(record.attempt_number);
            record.schedule_retry(now + delay);
            warn!(
                delivery_id = %record.delivery_id,
                subscription_id = %record.subscription_id,
                attempt_number = record.attempt_number,
                max_attempts = record.max_attempts,
                retry_in = ?delay,
                error = ?record.error_message,
                "Webhook delivery failed, will retry"
            );
        }
    }

    /// Persist a delivery whose payload could not be encoded. It is failed
    /// straight away: retrying cannot fix it.
    async fn record_serialization_fault(
        &self,
        subscription: &Subscription,
        delivery_id: DeliveryId,
        event_type: &str,
        fault: String,
        now: OffsetDateTime,
    ) -> Result<TriggerResult, WebhookError> {
        let mut record = DeliveryAttemptRecord::pending(
            subscription,
            event_type,
            String::new(),
            BTreeMap::new(),
            self.config.max_attempts,
            now,
            self.config.claim_lease,
        )
        .with_delivery_id(delivery_id);
        record.record_response(
            None,
            None,
            Some(format!("Payload serialization failed: {fault}")),
            None,
        );
        record.mark_failed(now);
        self.deliveries.create(&record).await?;

        error!(
            delivery_id = %record.delivery_id,
            subscription_id = %subscription.id,
            event_type = %event_type,
            error = %fault,
            "Webhook payload could not be serialized"
        );
        Ok(TriggerResult::from_record(&record))
    }
}

/// Build the exact body and headers of a delivery.
///
/// Subscription extra headers go first; the engine's own headers always win,
/// compared case-insensitively.
fn build_request<T>(
    subscription: &Subscription,
    delivery_id: &DeliveryId,
    event_type: &str,
    data: &T,
    now: OffsetDateTime,
) -> Result<(String, BTreeMap<String, String>), String>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_value(data).map_err(|e| e.to_string())?;
    let payload = WebhookPayload::new(event_type, now, &subscription.organization_id, data);
    let body = canonical_json(&payload).map_err(|e| e.to_string())?;
    let timestamp = now.format(&Rfc3339).map_err(|e| e.to_string())?;
    let signature = HmacSigner::new(subscription.secret.as_str()).sign(&timestamp, &body);

    let mut headers: BTreeMap<String, String> = subscription
        .extra_headers
        .iter()
        .filter(|(name, _)| {
            !RESERVED_HEADERS
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert(HEADER_DELIVERY_ID.to_string(), delivery_id.to_string());
    headers.insert(HEADER_ORG_ID.to_string(), subscription.organization_id.clone());
    headers.insert(HEADER_EVENT_TYPE.to_string(), event_type.to_string());
    headers.insert(HEADER_TIMESTAMP.to_string(), timestamp);
    headers.insert(HEADER_SIGNATURE.to_string(), signature);

    Ok((body, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::webhook::clock::ManualClock;
    use crate::outbound::webhook::test_support::{self, ScriptedDispatcher};
    use serde::Serializer;
    use serde_json::json;
    use time::macros::datetime;
    use webhook_store::InMemoryStore;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        engine: DeliveryEngine,
        store: InMemoryStore,
        dispatcher: Arc<ScriptedDispatcher>,
        clock: ManualClock,
        subscription: Subscription,
    }

    fn harness(dispatcher: ScriptedDispatcher) -> Harness {
        harness_with(dispatcher, EngineConfig::default())
    }

    fn harness_with(dispatcher: ScriptedDispatcher, config: EngineConfig) -> Harness {
        let store = InMemoryStore::new();
        let dispatcher = Arc::new(dispatcher);
        let clock = ManualClock::new(datetime!(2025-02-10 14:30 UTC));
        let subscription = Subscription::new("org-42", "https://crm-partner.example.com/hooks")
            .subscribe_to(vec!["lead.created".to_string(), "deal.won".to_string()])
            .with_extra_header("X-Tenant", "acme");
        store
            .insert_subscription(subscription.clone())
            .expect("insert subscription");

        let engine = DeliveryEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            dispatcher.clone(),
            Arc::new(clock.clone()),
            config,
        );

        Harness {
            engine,
            store,
            dispatcher,
            clock,
            subscription,
        }
    }

    #[tokio::test]
    async fn successful_trigger_records_success_and_bumps_stats() {
        let h = harness(ScriptedDispatcher::always(200));

        let result = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({"lead_id": "L-1"}))
            .await
            .expect("trigger");

        assert!(result.delivered);
        assert_eq!(result.status_code, Some(200));

        let records = h.store.snapshot().expect("snapshot");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(Some(&record.delivery_id), result.delivery_id.as_ref());
        assert_eq!(record.status, DeliveryStatus::Success);
        assert_eq!(record.attempt_number, 1);
        assert_eq!(record.completed_at, Some(h.clock.now()));
        assert!(record.invariant_violation().is_none());

        let sub = h
            .store
            .get_by_id(&h.subscription.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(sub.trigger_count, 1);
        assert_eq!(sub.last_triggered_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn unsubscribed_event_creates_no_record() {
        let h = harness(ScriptedDispatcher::always(200));

        let result = h
            .engine
            .trigger(&h.subscription, "lead.deleted", &json!({"lead_id": "L-1"}))
            .await
            .expect("trigger");

        assert!(!result.delivered);
        assert_eq!(result.reason.as_deref(), Some(REASON_NOT_SUBSCRIBED));
        assert!(result.delivery_id.is_none());
        assert!(h.store.snapshot().expect("snapshot").is_empty());
        assert_eq!(h.dispatcher.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_subscription_creates_no_record() {
        let mut h = harness(ScriptedDispatcher::always(200));
        h.subscription.disable();

        let result = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");

        assert!(!result.delivered);
        assert!(h.store.snapshot().expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn request_is_signed_over_timestamp_and_body() {
        let h = harness(ScriptedDispatcher::always(204));

        h.engine
            .trigger(&h.subscription, "deal.won", &json!({"deal_id": "D-7", "amount": 1200}))
            .await
            .expect("trigger");

        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        let request = &sent[0];
        assert_eq!(request.url, "https://crm-partner.example.com/hooks");

        let timestamp = &request.headers[HEADER_TIMESTAMP];
        assert_eq!(timestamp, "2025-02-10T14:30:00Z");
        assert_eq!(request.headers[HEADER_EVENT_TYPE], "deal.won");
        assert_eq!(request.headers[HEADER_ORG_ID], "org-42");
        assert_eq!(request.headers["X-Tenant"], "acme");

        let signer = HmacSigner::new(h.subscription.secret.as_str());
        assert!(signer.verify(timestamp, &request.body, &request.headers[HEADER_SIGNATURE]));

        let body: serde_json::Value = serde_json::from_str(&request.body).expect("json body");
        assert_eq!(
            body,
            json!({
                "event": "deal.won",
                "timestamp": "2025-02-10T14:30:00Z",
                "organizationId": "org-42",
                "data": {"deal_id": "D-7", "amount": 1200}
            })
        );
    }

    #[tokio::test]
    async fn extra_headers_cannot_override_core_headers() {
        let mut h = harness(ScriptedDispatcher::always(200));
        h.subscription = h
            .subscription
            .clone()
            .with_extra_header("x-signature", "forged")
            .with_extra_header("X-Org-Id", "someone-else");

        h.engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");

        let headers = &h.dispatcher.sent()[0].headers;
        assert!(!headers.contains_key("x-signature"));
        assert_eq!(headers[HEADER_ORG_ID], "org-42");
        assert_ne!(headers[HEADER_SIGNATURE], "forged");
    }

    #[tokio::test]
    async fn first_failure_schedules_retry_after_one_minute() {
        let h = harness(ScriptedDispatcher::always(500));

        let result = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");

        assert!(!result.delivered);
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.status, Some(DeliveryStatus::Pending));

        let record = &h.store.snapshot().expect("snapshot")[0];
        assert_eq!(record.attempt_number, 1);
        assert_eq!(record.next_retry_at, Some(h.clock.now() + MINUTE));
        assert_eq!(record.error_message.as_deref(), Some("HTTP 500"));
        assert_eq!(record.response_body.as_deref(), Some("status 500"));
        assert!(record.claimed_until.is_none());
        assert!(record.invariant_violation().is_none());

        let sub = h
            .store
            .get_by_id(&h.subscription.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(sub.trigger_count, 0);
    }

    #[tokio::test]
    async fn transport_error_is_retryable_and_recorded() {
        let h = harness(ScriptedDispatcher::scripted(
            vec![test_support::timeout()],
            test_support::response(200),
        ));

        h.engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");

        let record = &h.store.snapshot().expect("snapshot")[0];
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert!(record.http_status_code.is_none());
        assert!(
            record
                .error_message
                .as_deref()
                .is_some_and(|m| m.starts_with("timeout"))
        );
    }

    #[tokio::test]
    async fn single_attempt_budget_fails_immediately() {
        let config = EngineConfig {
            max_attempts: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedDispatcher::always(503), config);

        h.engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");

        let record = &h.store.snapshot().expect("snapshot")[0];
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(record.next_retry_at.is_none());
        assert!(record.completed_at.is_some());
        assert!(record.invariant_violation().is_none());
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("lead has a cyclic reference"))
        }
    }

    #[tokio::test]
    async fn serialization_fault_fails_without_dispatch() {
        let h = harness(ScriptedDispatcher::always(200));

        let result = h
            .engine
            .trigger(&h.subscription, "lead.created", &Unserializable)
            .await
            .expect("trigger");

        assert!(!result.delivered);
        assert_eq!(result.status, Some(DeliveryStatus::Failed));
        assert_eq!(h.dispatcher.calls(), 0);

        let record = &h.store.snapshot().expect("snapshot")[0];
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(
            record
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("cyclic reference"))
        );
        assert!(record.invariant_violation().is_none());
    }

    #[tokio::test]
    async fn retry_now_redelivers_failed_record_with_same_request() {
        let config = EngineConfig {
            max_attempts: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(
            ScriptedDispatcher::scripted(vec![test_support::response(500)], test_support::response(200)),
            config,
        );
        let first = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({"lead_id": "L-9"}))
            .await
            .expect("trigger");
        let delivery_id = first.delivery_id.expect("delivery id");
        assert_eq!(first.status, Some(DeliveryStatus::Failed));

        h.clock.advance(10 * MINUTE);
        let retried = h.engine.retry_now(&delivery_id).await.expect("retry");

        assert!(retried.delivered);
        let record = h
            .store
            .find_by_id(&delivery_id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(record.status, DeliveryStatus::Success);
        assert_eq!(record.attempt_number, 2);
        assert_eq!(record.max_attempts, 2);
        assert!(record.invariant_violation().is_none());

        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].body, sent[1].body);
        assert_eq!(sent[0].headers, sent[1].headers);
    }

    #[tokio::test]
    async fn retry_now_that_fails_again_stays_failed() {
        let config = EngineConfig {
            max_attempts: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedDispatcher::always(500), config);
        let first = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");
        let delivery_id = first.delivery_id.expect("delivery id");

        let retried = h.engine.retry_now(&delivery_id).await.expect("retry");

        assert!(!retried.delivered);
        assert_eq!(retried.status, Some(DeliveryStatus::Failed));
        let record = h
            .store
            .find_by_id(&delivery_id)
            .await
            .expect("find")
            .expect("exists");
        assert!(record.next_retry_at.is_none());
        assert!(record.invariant_violation().is_none());
    }

    #[tokio::test]
    async fn retry_now_rejects_successful_delivery() {
        let h = harness(ScriptedDispatcher::always(200));
        let first = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");
        let delivery_id = first.delivery_id.expect("delivery id");

        let err = h.engine.retry_now(&delivery_id).await.unwrap_err();

        assert!(matches!(
            err,
            WebhookError::NotRetryable {
                status: DeliveryStatus::Success,
                ..
            }
        ));
        assert_eq!(h.dispatcher.calls(), 1);
    }

    #[tokio::test]
    async fn retry_now_rejects_pending_delivery() {
        let h = harness(ScriptedDispatcher::always(500));
        let first = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({}))
            .await
            .expect("trigger");

        let err = h
            .engine
            .retry_now(&first.delivery_id.expect("delivery id"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WebhookError::NotRetryable {
                status: DeliveryStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn retry_now_unknown_delivery_is_not_found() {
        let h = harness(ScriptedDispatcher::always(200));

        let err = h
            .engine
            .retry_now(&DeliveryId::from("does-not-exist"))
            .await
            .unwrap_err();

        assert!(matches!(err, WebhookError::DeliveryNotFound(_)));
    }

    async fn failed_delivery(h: &Harness) -> DeliveryId {
        let result = h
            .engine
            .trigger(&h.subscription, "lead.created", &json!({"lead_id": "L-3"}))
            .await
            .expect("trigger");
        assert_eq!(result.status, Some(DeliveryStatus::Failed));
        result.delivery_id.expect("delivery id")
    }

    #[tokio::test]
    async fn retry_now_for_deleted_subscription_is_not_found() {
        let config = EngineConfig {
            max_attempts: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedDispatcher::always(500), config);
        let delivery_id = failed_delivery(&h).await;
        h.store
            .remove_subscription(&h.subscription.id)
            .expect("remove");

        let err = h.engine.retry_now(&delivery_id).await.unwrap_err();

        assert!(
            matches!(err, WebhookError::SubscriptionNotFound(ref id) if *id == h.subscription.id)
        );
        assert_eq!(h.dispatcher.calls(), 1);
        let record = h
            .store
            .find_by_id(&delivery_id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempt_number, 1);
    }

    #[tokio::test]
    async fn retry_now_for_disabled_subscription_leaves_record_untouched() {
        let config = EngineConfig {
            max_attempts: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedDispatcher::always(500), config);
        let delivery_id = failed_delivery(&h).await;
        let before = h
            .store
            .find_by_id(&delivery_id)
            .await
            .expect("find")
            .expect("exists");

        let mut disabled = h.subscription.clone();
        disabled.disable();
        h.store.insert_subscription(disabled).expect("update");

        let result = h.engine.retry_now(&delivery_id).await.expect("retry");

        assert!(!result.delivered);
        assert_eq!(result.reason.as_deref(), Some(REASON_NOT_SUBSCRIBED));
        assert_eq!(result.delivery_id.as_ref(), Some(&delivery_id));
        assert_eq!(result.status, Some(DeliveryStatus::Failed));
        assert_eq!(h.dispatcher.calls(), 1);
        let after = h
            .store
            .find_by_id(&delivery_id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn short_claim_lease_is_raised_past_dispatch_timeout() {
        let config = EngineConfig {
            dispatch_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(1),
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedDispatcher::always(200), config);

        assert_eq!(
            h.engine.config().claim_lease,
            Duration::from_secs(30) + CLAIM_LEASE_MARGIN
        );
    }

    #[tokio::test]
    async fn attempt_that_lost_its_claim_does_not_overwrite_record() {
        let h = harness(ScriptedDispatcher::always(500));
        let lease = h.engine.config().claim_lease;
        let stale = DeliveryAttemptRecord::pending(
            &h.subscription,
            "lead.created",
            "{}".to_string(),
            BTreeMap::new(),
            5,
            h.clock.now(),
            lease,
        );
        h.store.create(&stale).await.expect("create");

        // The lease runs out and another worker takes the record over.
        h.clock.advance(lease);
        let taken = h
            .store
            .claim(&stale.delivery_id, h.clock.now(), lease)
            .await
            .expect("claim")
            .expect("expired lease is claimable");

        let err = h.engine.attempt(stale.clone(), &h.subscription).await.unwrap_err();

        assert!(matches!(err, WebhookError::ClaimLost(_)));
        let stored = h
            .store
            .find_by_id(&stale.delivery_id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(stored, taken);
        assert!(stored.error_message.is_none());
    }
}
