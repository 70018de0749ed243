//! # Delivery attempt records
//!
//! One record tracks one event's delivery to one subscription across every
//! retry. It is created once in `pending`, mutated in place by each attempt
//! and never re-created.
use crate::subscription::Subscription;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Attempts allowed per delivery unless configured otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// DeliveryId
// ============================================================================

/// Globally unique delivery identifier (random 128-bit token, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(String);

impl DeliveryId {
    /// Generate a fresh identifier. Identifiers are never reused.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeliveryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeliveryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// DeliveryStatus
// ============================================================================

/// Lifecycle state of a delivery. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DeliveryAttemptRecord
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttemptRecord {
    pub delivery_id: DeliveryId,
    pub subscription_id: String,
    pub organization_id: String,
    pub event_type: String,

    /// Snapshot of the subscription URL at creation time.
    pub target_url: String,

    /// Exact JSON body that was signed and is sent on every attempt.
    pub payload: String,

    /// Exact request headers (signature included) sent on every attempt.
    pub request_headers: BTreeMap<String, String>,

    pub status: DeliveryStatus,
    pub http_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,

    /// 1-based number of the latest attempt started.
    pub attempt_number: u32,
    pub max_attempts: u32,

    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,

    /// Lease held by whoever is running an attempt right now.
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_until: Option<OffsetDateTime>,

    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl DeliveryAttemptRecord {
    /// Create a `pending` record for the first attempt, snapshotting the
    /// subscription's url and organization.
    ///
    /// The record starts claimed: the first attempt runs immediately and
    /// the lease lets the scheduler recover it if the process dies first.
    pub fn pending(
        subscription: &Subscription,
        event_type: impl Into<String>,
        payload: String,
        request_headers: BTreeMap<String, String>,
        max_attempts: u32,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Self {
        Self {
            delivery_id: DeliveryId::generate(),
            subscription_id: subscription.id.clone(),
            organization_id: subscription.organization_id.clone(),
            event_type: event_type.into(),
            target_url: subscription.url.clone(),
            payload,
            request_headers,
            status: DeliveryStatus::Pending,
            http_status_code: None,
            response_body: None,
            error_message: None,
            response_time_ms: None,
            attempt_number: 1,
            max_attempts: max_attempts.max(1),
            next_retry_at: None,
            claimed_until: Some(now + lease),
            completed_at: None,
            created_at: now,
        }
    }

    /// Use a caller-provided delivery id (the one already baked into the headers).
    pub fn with_delivery_id(mut self, delivery_id: DeliveryId) -> Self {
        self.delivery_id = delivery_id;
        self
    }

    /// Store the diagnostics of the attempt that just finished.
    pub fn record_response(
        &mut self,
        http_status_code: Option<u16>,
        response_body: Option<String>,
        error_message: Option<String>,
        response_time_ms: Option<u64>,
    ) {
        self.http_status_code = http_status_code;
        self.response_body = response_body;
        self.error_message = error_message;
        self.response_time_ms = response_time_ms;
    }

    pub fn mark_success(&mut self, now: OffsetDateTime) {
        self.status = DeliveryStatus::Success;
        self.next_retry_at = None;
        self.claimed_until = None;
        self.completed_at = Some(now);
    }

    /// Terminal failure: no further attempts.
    pub fn mark_failed(&mut self, now: OffsetDateTime) {
        self.status = DeliveryStatus::Failed;
        self.next_retry_at = None;
        self.claimed_until = None;
        self.completed_at = Some(now);
    }

    /// Keep the record pending and release it for the scheduler.
    pub fn schedule_retry(&mut self, at: OffsetDateTime) {
        self.status = DeliveryStatus::Pending;
        self.next_retry_at = Some(at);
        self.claimed_until = None;
        self.completed_at = None;
    }

    /// Whether the scheduler may claim this record at `now`.
    ///
    /// Unclaimed records are due once `next_retry_at` has passed. Claimed
    /// records become due again only when their lease expired, which means
    /// the worker running the attempt disappeared.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        if self.status != DeliveryStatus::Pending {
            return false;
        }
        match self.claimed_until {
            Some(lease) => lease <= now,
            None => self.next_retry_at.is_some_and(|at| at <= now),
        }
    }

    /// Take the lease for an attempt.
    pub fn claim(&mut self, now: OffsetDateTime, lease: Duration) {
        self.claimed_until = Some(now + lease);
    }

    /// Advance to the attempt the scheduler is about to run.
    ///
    /// A record claimed while waiting on `next_retry_at` starts a new
    /// attempt. One recovered from an expired lease re-runs the attempt that
    /// was interrupted, so `attempt_number` never exceeds `max_attempts`.
    pub fn start_scheduled_attempt(&mut self) {
        if self.next_retry_at.take().is_some() {
            self.attempt_number = (self.attempt_number + 1).min(self.max_attempts);
        }
    }

    /// Reopen a `failed` record for one manual attempt outside the schedule.
    ///
    /// `max_attempts` is raised only as far as needed to fit the extra attempt.
    pub fn reopen_for_manual_retry(&mut self, now: OffsetDateTime, lease: Duration) {
        self.attempt_number += 1;
        self.max_attempts = self.max_attempts.max(self.attempt_number);
        self.status = DeliveryStatus::Pending;
        self.next_retry_at = None;
        self.completed_at = None;
        self.claimed_until = Some(now + lease);
    }

    /// Check the record-level invariants for a record that is not under claim.
    ///
    /// Returns a description of the first violation found.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if self.attempt_number > self.max_attempts {
            return Some("attempt_number exceeds max_attempts");
        }
        if self.claimed_until.is_some() {
            return None;
        }
        let expects_retry =
            self.status == DeliveryStatus::Pending && self.attempt_number < self.max_attempts;
        if self.next_retry_at.is_some() != expects_retry {
            return Some("next_retry_at must be set iff pending with attempts remaining");
        }
        if self.completed_at.is_some() != self.status.is_terminal() {
            return Some("completed_at must be set iff status is terminal");
        }
        None
    }
}
