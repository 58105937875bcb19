//! Retry & backoff: the single consumer of delivery reports.
//!
//! Owns the delayed-retry heap. A task is only ever re-enqueued after the
//! report for its previous attempt has been handled here, so one task never
//! has two attempts in flight.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

use crate::dispatcher::DispatcherConfig;
use crate::error::{DeliveryOutcome, SkipReason, TransientFailure};
use crate::jobs::{JobRegistry, Resolution};
use crate::store::{HealthUpdate, SubscriptionStore};
use crate::types::DeliveryTask;
use crate::worker::DeliveryReport;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Delay before re-offering a task to a full queue.
const QUEUE_FULL_RETRY: Duration = Duration::from_millis(5);

/// Far-future wakeup used when the heap is empty.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    task: DeliveryTask,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct RetryScheduler {
    config: DispatcherConfig,
    store: Arc<dyn SubscriptionStore>,
    jobs: Arc<JobRegistry>,
    queue_tx: Option<mpsc::Sender<DeliveryTask>>,
    report_rx: mpsc::UnboundedReceiver<DeliveryReport>,
    shutdown: Arc<Notify>,
    delay_heap: BinaryHeap<TimedTask>,
    draining: bool,
}

impl RetryScheduler {
    pub(crate) fn new(
        config: DispatcherConfig,
        store: Arc<dyn SubscriptionStore>,
        jobs: Arc<JobRegistry>,
        queue_tx: mpsc::Sender<DeliveryTask>,
        report_rx: mpsc::UnboundedReceiver<DeliveryReport>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            store,
            jobs,
            queue_tx: Some(queue_tx),
            report_rx,
            shutdown,
            delay_heap: BinaryHeap::new(),
            draining: false,
        }
    }

    /// Run until every worker has exited and the report channel is closed.
    pub(crate) async fn run(mut self) {
        loop {
            let next_ready = self
                .delay_heap
                .peek()
                .map(|t| t.ready_at)
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);
            let shutdown = self.shutdown.clone();

            tokio::select! {
                report = self.report_rx.recv() => match report {
                    Some(report) => self.handle_report(report).await,
                    None => break,
                },
                _ = sleep_until(next_ready), if !self.delay_heap.is_empty() => {
                    self.release_due().await;
                }
                _ = shutdown.notified(), if !self.draining => {
                    self.begin_drain().await;
                }
            }
        }

        tracing::debug!("retry scheduler stopped");
    }

    /// Stop re-enqueueing; resolve every delayed task as cancelled and close
    /// the scheduler's side of the queue.
    async fn begin_drain(&mut self) {
        self.draining = true;
        self.queue_tx = None;
        while let Some(timed) = self.delay_heap.pop() {
            self.jobs.resolve(timed.task.job_id, Resolution::Cancelled).await;
        }
        tracing::info!("retry scheduler draining");
    }

    async fn handle_report(&mut self, report: DeliveryReport) {
        let DeliveryReport { task, outcome, at_secs } = report;

        match outcome {
            DeliveryOutcome::Delivered => {
                self.mark(&task, HealthUpdate::Delivered { at_secs }).await;
                self.jobs.resolve(task.job_id, Resolution::Succeeded).await;
                metric_inc("push.job.task_succeeded");
            }
            DeliveryOutcome::Permanent(reason) => {
                let update = if reason.evicts() {
                    Some(HealthUpdate::Evicted)
                } else if reason.blames_endpoint() {
                    Some(HealthUpdate::Failed)
                } else {
                    None
                };
                tracing::info!(
                    job_id = %task.job_id,
                    attempt = task.attempt,
                    reason = %reason,
                    evicted = reason.evicts(),
                    "delivery failed permanently"
                );
                if let Some(update) = update {
                    self.mark(&task, update).await;
                }
                self.jobs.resolve(task.job_id, Resolution::Failed).await;
                metric_inc("push.job.task_failed");
            }
            DeliveryOutcome::Transient(reason) => {
                if self.draining || self.jobs.is_cancelled(task.job_id).await {
                    self.jobs.resolve(task.job_id, Resolution::Cancelled).await;
                    return;
                }

                // A store outage says nothing about the endpoint.
                let store_fault = matches!(reason, TransientFailure::StoreUnavailable);
                let mut task = task;
                if !store_fault {
                    task.sent = true;
                }

                if task.attempt >= self.config.max_attempts {
                    tracing::info!(
                        job_id = %task.job_id,
                        attempts = task.attempt,
                        reason = %reason,
                        "retry attempts exhausted"
                    );
                    let update = if store_fault {
                        task.sent.then_some(HealthUpdate::Failed)
                    } else if self.config.evict_on_exhaustion {
                        Some(HealthUpdate::Evicted)
                    } else {
                        Some(HealthUpdate::Failed)
                    };
                    if let Some(update) = update {
                        self.mark(&task, update).await;
                    }
                    self.jobs.resolve(task.job_id, Resolution::Failed).await;
                    metric_inc("push.job.task_failed");
                    return;
                }

                let ready_at = Instant::now() + self.config.retry_delay(task.attempt);
                if task.sent && ready_at >= task.deadline {
                    self.expire(&task).await;
                    return;
                }

                tracing::debug!(
                    job_id = %task.job_id,
                    attempt = task.attempt,
                    reason = %reason,
                    "retry scheduled"
                );
                task.attempt += 1;
                self.delay_heap.push(TimedTask { ready_at, task });
                metric_inc("push.delivery.retry_scheduled");
            }
            DeliveryOutcome::Skipped(SkipReason::Busy) => {
                if self.draining || self.jobs.is_cancelled(task.job_id).await {
                    self.jobs.resolve(task.job_id, Resolution::Cancelled).await;
                    return;
                }
                let ready_at = Instant::now() + Duration::from_millis(self.config.busy_retry_ms);
                if task.sent && ready_at >= task.deadline {
                    self.expire(&task).await;
                    return;
                }
                self.delay_heap.push(TimedTask { ready_at, task });
            }
            DeliveryOutcome::Skipped(SkipReason::Expired) => {
                self.expire(&task).await;
            }
            DeliveryOutcome::Skipped(SkipReason::Cancelled) => {
                self.jobs.resolve(task.job_id, Resolution::Cancelled).await;
            }
            DeliveryOutcome::Skipped(SkipReason::Unregistered) => {
                self.jobs.resolve(task.job_id, Resolution::Failed).await;
            }
        }
    }

    /// Move every due task back onto the delivery queue.
    async fn release_due(&mut self) {
        let now = Instant::now();
        while let Some(timed) = self.delay_heap.peek() {
            if timed.ready_at > now {
                break;
            }
            let Some(timed) = self.delay_heap.pop() else { break };
            let task = timed.task;

            if self.jobs.is_cancelled(task.job_id).await {
                self.jobs.resolve(task.job_id, Resolution::Cancelled).await;
                continue;
            }
            if task.lapsed(now) {
                self.expire(&task).await;
                continue;
            }

            let Some(queue_tx) = self.queue_tx.as_ref() else {
                self.jobs.resolve(task.job_id, Resolution::Cancelled).await;
                continue;
            };
            match queue_tx.try_send(task) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(task)) => {
                    self.delay_heap.push(TimedTask {
                        ready_at: now + QUEUE_FULL_RETRY,
                        task,
                    });
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(task)) => {
                    self.jobs.resolve(task.job_id, Resolution::Cancelled).await;
                }
            }
        }
    }

    /// Deadline passed: count the failure but never evict for it. A task
    /// that never reached the transport is not held against the endpoint.
    async fn expire(&self, task: &DeliveryTask) {
        tracing::debug!(job_id = %task.job_id, attempt = task.attempt, "delivery expired");
        if task.sent {
            self.mark(task, HealthUpdate::Failed).await;
        }
        self.jobs.resolve(task.job_id, Resolution::Failed).await;
        metric_inc("push.delivery.expired");
    }

    async fn mark(&self, task: &DeliveryTask, update: HealthUpdate) {
        if let Err(err) = self.store.mark_outcome(&task.subscription_id, update).await {
            tracing::warn!(
                job_id = %task.job_id,
                error = %err,
                "failed to record subscription health"
            );
        }
    }
}
