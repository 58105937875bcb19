use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Instant};

use crate::encoder::PayloadEncoder;
use crate::error::{
    DeliveryOutcome, EncodeError, PermanentFailure, SkipReason, TransientFailure, TransportError,
};
use crate::jobs::JobRegistry;
use crate::rate_limit::{origin_of, RateLimiter};
use crate::store::SubscriptionStore;
use crate::transport::{classify, PushTransport};
use crate::types::{now_secs, DeliveryTask, SubscriptionId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Result of processing one task, consumed exactly once by the scheduler.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub task: DeliveryTask,
    pub outcome: DeliveryOutcome,
    pub at_secs: u64,
}

/// Identities with an attempt currently on the wire.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: StdMutex<HashSet<SubscriptionId>>,
}

impl InFlight {
    /// Claim `id`, or `None` if another attempt already holds it.
    pub fn try_claim(&self, id: &SubscriptionId) -> Option<InFlightGuard<'_>> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if ids.insert(id.clone()) {
            Some(InFlightGuard { owner: self, id: id.clone() })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
    id: SubscriptionId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut ids = self.owner.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.id);
    }
}

/// Shared, read-only context for all workers.
pub struct WorkerContext {
    pub store: Arc<dyn SubscriptionStore>,
    pub encoder: Arc<dyn PayloadEncoder>,
    pub transport: Arc<dyn PushTransport>,
    pub rate_limiter: Arc<RateLimiter>,
    pub jobs: Arc<JobRegistry>,
    pub in_flight: InFlight,
    pub send_timeout: Duration,
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls tasks from the shared queue
/// - Makes at most one transport attempt per task
/// - Reports every task to the scheduler, never retries itself
pub async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<DeliveryTask>>>,
    report_tx: mpsc::UnboundedSender<DeliveryReport>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(task) = task else { break };

        let outcome = process_task(&task, &ctx).await;
        let report = DeliveryReport {
            task,
            outcome,
            at_secs: now_secs(),
        };
        if report_tx.send(report).is_err() {
            break;
        }
    }
}

/// Process a single delivery attempt.
async fn process_task(task: &DeliveryTask, ctx: &WorkerContext) -> DeliveryOutcome {
    if ctx.jobs.is_cancelled(task.job_id).await {
        return DeliveryOutcome::Skipped(SkipReason::Cancelled);
    }
    if task.lapsed(Instant::now()) {
        return DeliveryOutcome::Skipped(SkipReason::Expired);
    }

    let subscription = match ctx.store.get(&task.subscription_id).await {
        Ok(Some(s)) if s.is_active() => s,
        Ok(_) => return DeliveryOutcome::Skipped(SkipReason::Unregistered),
        Err(err) => {
            tracing::warn!(error = %err, "subscription lookup failed");
            return DeliveryOutcome::Transient(TransientFailure::StoreUnavailable);
        }
    };

    let Some(_claim) = ctx.in_flight.try_claim(&subscription.id) else {
        return DeliveryOutcome::Skipped(SkipReason::Busy);
    };

    let Some(origin) = origin_of(subscription.endpoint()) else {
        return DeliveryOutcome::Permanent(PermanentFailure::MalformedSubscription);
    };

    if task.sent {
        if timeout_at(task.deadline, ctx.rate_limiter.acquire(&origin)).await.is_err() {
            return DeliveryOutcome::Skipped(SkipReason::Expired);
        }
    } else {
        ctx.rate_limiter.acquire(&origin).await;
    }

    let message = match ctx.encoder.encode(
        &task.payload,
        &subscription,
        task.remaining_ttl(Instant::now()),
    ) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(job_id = %task.job_id, error = %err, "payload encoding failed");
            return DeliveryOutcome::Permanent(encode_failure(&err));
        }
    };

    let result = match timeout(
        ctx.send_timeout,
        ctx.transport.send(subscription.endpoint(), &message),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    };

    let outcome = classify(result);
    match &outcome {
        DeliveryOutcome::Delivered => metric_inc("push.delivery.success"),
        DeliveryOutcome::Transient(_) => metric_inc("push.delivery.transient_failure"),
        DeliveryOutcome::Permanent(_) => metric_inc("push.delivery.permanent_failure"),
        DeliveryOutcome::Skipped(_) => {}
    }
    tracing::debug!(
        job_id = %task.job_id,
        attempt = task.attempt,
        origin = %origin,
        outcome = ?outcome,
        "delivery attempt finished"
    );
    outcome
}

/// Key problems are the subscription's; size problems are the payload's.
fn encode_failure(err: &EncodeError) -> PermanentFailure {
    match err {
        EncodeError::MissingKeys => PermanentFailure::MalformedSubscription,
        EncodeError::PayloadTooLarge { .. } => PermanentFailure::PayloadRejected,
    }
}
