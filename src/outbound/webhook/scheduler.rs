use crate::config::SchedulerConfig;
use crate::outbound::webhook::delivery_service::DeliveryEngine;
use crate::outbound::webhook::error::WebhookError;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use webhook_store::{DeliveryAttemptRecord, DeliveryStatus};

/// Error recorded on deliveries whose subscription vanished before a retry.
pub const SUBSCRIPTION_GONE: &str = "subscription removed or disabled";

/// What one scheduler tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Records this tick took ownership of.
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Due records another worker claimed first or took over mid-attempt.
    pub skipped: usize,
    /// Records left untouched because of a store error.
    pub errors: usize,
}

enum Outcome {
    Skipped,
    Delivered,
    Rescheduled,
    Failed,
}

/// Periodically retries due deliveries through [`DeliveryEngine::attempt`].
///
/// Records are claimed before any mutation, so several schedulers (or
/// processes sharing a database) never run the same attempt twice.
pub struct RetryScheduler {
    engine: Arc<DeliveryEngine>,

    interval: Duration,

    concurrency: usize,

    batch_size: usize,

    running: AtomicBool,
}

/// Clears the running flag even if the tick future is dropped midway.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryScheduler {
    pub fn new(
        engine: Arc<DeliveryEngine>,
        interval: Duration,
        concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(1)),
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(engine: Arc<DeliveryEngine>, config: &SchedulerConfig) -> Self {
        Self::new(
            engine,
            config.interval(),
            config.concurrency,
            config.batch_size,
        )
    }

    /// Whether a tick is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the periodic loop. The first tick runs immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&self);

        info!(
            interval = ?self.interval,
            concurrency = self.concurrency,
            batch_size = self.batch_size,
            "Webhook retry scheduler starting"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scheduler.tick().await {
                            Ok(report) if report.claimed > 0 || report.errors > 0 => {
                                info!(
                                    claimed = report.claimed,
                                    delivered = report.delivered,
                                    rescheduled = report.rescheduled,
                                    failed = report.failed,
                                    skipped = report.skipped,
                                    errors = report.errors,
                                    "Retry tick finished"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Retry tick failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Webhook retry scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, task }
    }

    /// Claim and process every due record once.
    ///
    /// Returns an empty report without touching the store if a previous
    /// tick is still running.
    pub async fn tick(&self) -> Result<TickReport, WebhookError> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Previous retry tick still running, skipping");
            return Ok(TickReport::default());
        }
        let _guard = RunningGuard(&self.running);

        let now = self.engine.clock().now();
        let due = self
            .engine
            .deliveries()
            .find_due_retries(now, self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(TickReport::default());
        }
        debug!(due = due.len(), "Processing due webhook deliveries");

        let outcomes: Vec<Result<Outcome, WebhookError>> = futures::stream::iter(due)
            .map(|record| self.process(record))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = TickReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(Outcome::Skipped) | Err(WebhookError::ClaimLost(_)) => report.skipped += 1,
                Ok(Outcome::Delivered) => {
                    report.claimed += 1;
                    report.delivered += 1;
                }
                Ok(Outcome::Rescheduled) => {
                    report.claimed += 1;
                    report.rescheduled += 1;
                }
                Ok(Outcome::Failed) => {
                    report.claimed += 1;
                    report.failed += 1;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(error = %e, "Failed to process due webhook delivery");
                }
            }
        }
        Ok(report)
    }

    async fn process(&self, due: DeliveryAttemptRecord) -> Result<Outcome, WebhookError> {
        let engine = &self.engine;
        let now = engine.clock().now();

        let Some(mut record) = engine
            .deliveries()
            .claim(&due.delivery_id, now, engine.config().claim_lease)
            .await?
        else {
            debug!(delivery_id = %due.delivery_id, "Delivery already claimed, skipping");
            return Ok(Outcome::Skipped);
        };

        let subscription = engine
            .subscriptions()
            .get_by_id(&record.subscription_id)
            .await?
            .filter(|s| s.enabled);

        let lease = record.claimed_until;
        let Some(subscription) = subscription else {
            record.error_message = Some(SUBSCRIPTION_GONE.to_string());
            record.mark_failed(now);
            engine.write_claimed(&record, lease).await?;
            warn!(
                delivery_id = %record.delivery_id,
                subscription_id = %record.subscription_id,
                "Subscription removed or disabled, delivery failed"
            );
            return Ok(Outcome::Failed);
        };

        record.start_scheduled_attempt();
        engine.write_claimed(&record, lease).await?;
        debug!(
            delivery_id = %record.delivery_id,
            attempt_number = record.attempt_number,
            "Retrying webhook delivery"
        );

        let record = engine.attempt(record, &subscription).await?;
        Ok(match record.status {
            DeliveryStatus::Success => Outcome::Delivered,
            DeliveryStatus::Pending => Outcome::Rescheduled,
            DeliveryStatus::Failed => Outcome::Failed,
        })
    }
}

/// Owner of a running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,

    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop once the current tick (if any) has finished.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Retry scheduler task ended abnormally");
        }
    }
}
