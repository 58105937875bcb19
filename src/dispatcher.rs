use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::encoder::PayloadEncoder;
use crate::error::DispatchError;
use crate::jobs::{JobRegistry, Resolution};
use crate::rate_limit::{RateLimit, RateLimiter, RateLimiterStats};
use crate::scheduler::RetryScheduler;
use crate::store::SubscriptionStore;
use crate::transport::PushTransport;
use crate::types::{DeliveryTask, JobId, JobStatus, Subscription};
use crate::worker::{worker_loop, InFlight, WorkerContext};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bound of the shared delivery queue.
    pub queue_capacity: usize,
    /// Number of concurrent delivery workers, at least one.
    pub worker_count: usize,
    /// Attempts per task, the first one included.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    /// Evict a subscription whose task ran out of attempts.
    pub evict_on_exhaustion: bool,
    /// Delay before re-offering a task whose subscription is busy.
    pub busy_retry_ms: u64,
    /// Upper bound for one transport send.
    pub send_timeout_ms: u64,
    /// Finished jobs kept for status queries.
    pub job_retention: usize,
    /// Per-origin limits, keyed by `scheme://host[:port]`.
    pub origin_limits: HashMap<String, RateLimit>,
    /// Limit for origins missing from `origin_limits`.
    pub default_origin_limit: Option<RateLimit>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            queue_capacity: 10_000,
            worker_count,
            max_attempts: 5,
            retry_base_ms: 100,
            retry_max_ms: 30_000,
            retry_jitter_ms: 50,
            evict_on_exhaustion: true,
            busy_retry_ms: 20,
            send_timeout_ms: 10_000,
            job_retention: 1_024,
            origin_limits: HashMap::new(),
            default_origin_limit: None,
        }
    }
}

impl DispatcherConfig {
    /// Backoff before the attempt following `attempt`.
    ///
    /// `retry_base_ms * 2^(attempt-1)` plus jitter, capped at `retry_max_ms`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_base_ms.max(1);
        let max = self.retry_max_ms.max(base);
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        let exp = base.saturating_mul(pow).min(max);
        let jitter = if self.retry_jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=self.retry_jitter_ms)
        };
        Duration::from_millis(exp.saturating_add(jitter).min(max))
    }
}

/// Broadcast coordinator and owner of the worker pool and retry scheduler.
pub struct Dispatcher {
    queue_tx: Mutex<Option<mpsc::Sender<DeliveryTask>>>,
    is_running: Arc<AtomicBool>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    feeder_handles: Mutex<Vec<JoinHandle<()>>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    ctx: Arc<WorkerContext>,
    jobs: Arc<JobRegistry>,
    store: Arc<dyn SubscriptionStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Start the worker pool and the retry scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn SubscriptionStore>,
        encoder: Arc<dyn PayloadEncoder>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared_queue_rx = Arc::new(Mutex::new(queue_rx));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let jobs = Arc::new(JobRegistry::new(config.job_retention));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.origin_limits.clone(),
            config.default_origin_limit,
        ));

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            encoder,
            transport,
            rate_limiter,
            jobs: jobs.clone(),
            in_flight: InFlight::default(),
            send_timeout: Duration::from_millis(config.send_timeout_ms.max(1)),
        });

        let worker_count = config.worker_count.max(1);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            worker_handles.push(tokio::spawn(worker_loop(
                shared_queue_rx.clone(),
                report_tx.clone(),
                ctx.clone(),
            )));
        }
        drop(report_tx);

        let shutdown = Arc::new(Notify::new());
        let scheduler = RetryScheduler::new(
            config.clone(),
            store.clone(),
            jobs.clone(),
            queue_tx.clone(),
            report_rx,
            shutdown.clone(),
        );
        let scheduler_handle = tokio::spawn(scheduler.run());

        tracing::info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            max_attempts = config.max_attempts,
            "dispatcher started"
        );

        Self {
            queue_tx: Mutex::new(Some(queue_tx)),
            is_running: Arc::new(AtomicBool::new(true)),
            worker_handles: Mutex::new(worker_handles),
            feeder_handles: Mutex::new(Vec::new()),
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            shutdown,
            ctx,
            jobs,
            store,
            config,
        }
    }

    /// Deliver `payload` to every active subscription.
    ///
    /// Returns as soon as all tasks are queued. A job that fits the queue
    /// is admitted whole or not at all: when the queue lacks room it fails
    /// with [`DispatchError::QueueFull`] and is never registered. A job
    /// larger than the whole queue is registered at once and fed in the
    /// background as workers make room.
    pub async fn broadcast(
        &self,
        payload: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<JobId, DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }

        let payload: Vec<u8> = payload.into();
        let max = self.ctx.encoder.max_payload();
        if payload.len() > max {
            metric_inc("push.dispatch.payload_too_large");
            return Err(DispatchError::PayloadTooLarge { size: payload.len(), max });
        }

        let targets = self.store.list_active().await.map_err(|err| {
            metric_inc("push.dispatch.store_unavailable");
            tracing::warn!(error = %err, "broadcast rejected, store unavailable");
            DispatchError::StoreUnavailable(err.to_string())
        })?;

        let job_id = JobId::new();
        if targets.is_empty() {
            self.jobs.create(job_id, 0).await;
            tracing::info!(%job_id, "broadcast has no active subscriptions");
            return Ok(job_id);
        }

        let guard = self.queue_tx.lock().await;
        let Some(queue_tx) = guard.as_ref() else {
            return Err(DispatchError::Shutdown);
        };

        let requested = targets.len();
        let payload: Arc<[u8]> = Arc::from(payload);
        let created_at = Instant::now();
        let task_for = |subscription: Subscription| DeliveryTask {
            job_id,
            subscription_id: subscription.id,
            payload: payload.clone(),
            ttl,
            deadline: created_at + ttl,
            attempt: 1,
            sent: false,
            created_at,
        };

        if requested > queue_tx.max_capacity() {
            self.jobs.create(job_id, requested).await;
            let tasks: Vec<DeliveryTask> = targets.into_iter().map(&task_for).collect();
            let feeder = tokio::spawn(feed_job(
                queue_tx.clone(),
                job_id,
                tasks,
                self.jobs.clone(),
                self.is_running.clone(),
            ));
            let mut feeders = self.feeder_handles.lock().await;
            feeders.retain(|handle| !handle.is_finished());
            feeders.push(feeder);

            metric_inc("push.dispatch.enqueued");
            tracing::info!(%job_id, tasks = requested, ttl_secs = ttl.as_secs(), "broadcast feeding");
            return Ok(job_id);
        }

        let permits = match queue_tx.try_reserve_many(requested) {
            Ok(permits) => permits,
            Err(mpsc::error::TrySendError::Full(())) => {
                metric_inc("push.dispatch.queue_full");
                let available = queue_tx.capacity();
                tracing::warn!(requested, available, "broadcast rejected, queue full");
                return Err(DispatchError::QueueFull { requested, available });
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(DispatchError::Shutdown);
            }
        };

        self.jobs.create(job_id, requested).await;
        for (permit, subscription) in permits.zip(targets) {
            permit.send(task_for(subscription));
        }

        metric_inc("push.dispatch.enqueued");
        tracing::info!(%job_id, tasks = requested, ttl_secs = ttl.as_secs(), "broadcast enqueued");
        Ok(job_id)
    }

    pub async fn job_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.jobs.status(*job_id).await
    }

    /// Subscribe to status changes of a job.
    pub async fn watch_job(&self, job_id: &JobId) -> Option<watch::Receiver<JobStatus>> {
        self.jobs.watch(*job_id).await
    }

    /// Wait until every task of the job has been resolved.
    pub async fn wait_for_job(&self, job_id: &JobId) -> Option<JobStatus> {
        let mut rx = self.jobs.watch(*job_id).await?;
        let status = rx.wait_for(|s| s.is_terminal()).await.ok()?.clone();
        Some(status)
    }

    /// Cancel a running job.
    ///
    /// Attempts already on the wire finish; queued and delayed tasks are
    /// dropped and no further retries are scheduled.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        let cancelled = self.jobs.cancel(*job_id).await;
        if cancelled {
            metric_inc("push.dispatch.cancelled");
            tracing::info!(%job_id, "broadcast cancelled");
        }
        cancelled
    }

    /// Tasks currently waiting in the delivery queue.
    pub async fn queue_depth(&self) -> usize {
        let guard = self.queue_tx.lock().await;
        guard
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Jobs that still have unresolved tasks.
    pub async fn running_jobs(&self) -> usize {
        self.jobs.running().await
    }

    pub async fn rate_limiter_stats(&self) -> HashMap<String, RateLimiterStats> {
        self.ctx.rate_limiter.stats().await
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting broadcasts, drop pending retries, let workers finish
    /// the tasks already queued, then join everything.
    pub async fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("dispatcher shutting down");

        self.queue_tx.lock().await.take();
        self.shutdown.notify_one();

        let feeders: Vec<JoinHandle<()>> = self.feeder_handles.lock().await.drain(..).collect();
        for handle in feeders {
            let _ = handle.await;
        }

        let workers: Vec<JoinHandle<()>> = self.worker_handles.lock().await.drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }

        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("dispatcher stopped");
    }
}

/// Push the tasks of an oversized job as room frees up. Tasks left over
/// after cancellation or shutdown are resolved as cancelled.
async fn feed_job(
    queue_tx: mpsc::Sender<DeliveryTask>,
    job_id: JobId,
    tasks: Vec<DeliveryTask>,
    jobs: Arc<JobRegistry>,
    is_running: Arc<AtomicBool>,
) {
    let total = tasks.len();
    let mut fed = 0;
    for task in tasks {
        if !is_running.load(Ordering::SeqCst) || jobs.is_cancelled(job_id).await {
            break;
        }
        let Ok(permit) = queue_tx.reserve().await else { break };
        permit.send(task);
        fed += 1;
    }

    for _ in fed..total {
        jobs.resolve(job_id, Resolution::Cancelled).await;
    }
    tracing::debug!(%job_id, fed, dropped = total - fed, "broadcast fed");
}
