#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use push_dispatcher::{
    Dispatcher, DispatcherConfig, EncodeError, HealthUpdate, InMemoryStore, PayloadEncoder,
    PushTransport, SignedPassthroughEncoder, StoreError, Subscription, SubscriptionId,
    SubscriptionKeys, SubscriptionStore, TransportError, WireMessage,
};

pub fn subscription(endpoint: &str) -> Subscription {
    Subscription::new(
        endpoint,
        SubscriptionKeys { p256dh: vec![4, 17, 42], auth: b"0123456789abcdef".to_vec() },
    )
}

pub fn endpoint(n: usize) -> String {
    format!("https://push.example.com/sub/{n:03}")
}

/// Small delays and no jitter so retries stay fast and predictable.
pub fn fast_config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        worker_count: workers,
        queue_capacity: 1_000,
        retry_base_ms: 1,
        retry_max_ms: 10,
        retry_jitter_ms: 0,
        busy_retry_ms: 2,
        send_timeout_ms: 1_000,
        ..Default::default()
    }
}

#[derive(Default)]
struct Counters {
    attempts: HashMap<String, u32>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
}

/// Transport with per-endpoint scripted replies.
///
/// Endpoints without a script (or with an exhausted one) get the
/// default status, optionally replaced by a 503 at `failure_rate`.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<u16, TransportError>>>>,
    default_status: u16,
    failure_rate: f64,
    delay: Duration,
    counters: Mutex<Counters>,
}

impl ScriptedTransport {
    pub fn new(default_status: u16) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_status,
            failure_rate: 0.0,
            delay: Duration::ZERO,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate;
        self
    }

    pub fn script(self, endpoint: &str, replies: Vec<Result<u16, TransportError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), replies.into());
        self
    }

    pub fn attempts(&self, endpoint: &str) -> u32 {
        self.counters.lock().unwrap().attempts.get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.counters.lock().unwrap().attempts.values().sum()
    }

    /// Highest number of simultaneous sends seen for any single endpoint.
    pub fn max_in_flight(&self) -> usize {
        self.counters.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn send(&self, endpoint: &str, _message: &WireMessage) -> Result<u16, TransportError> {
        {
            let mut counters = self.counters.lock().unwrap();
            *counters.attempts.entry(endpoint.to_string()).or_default() += 1;
            let current = counters.in_flight.entry(endpoint.to_string()).or_default();
            *current += 1;
            let current = *current;
            counters.max_in_flight = counters.max_in_flight.max(current);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(|replies| replies.pop_front());
        let reply = match scripted {
            Some(reply) => reply,
            None if self.failure_rate > 0.0 && fastrand::f64() < self.failure_rate => Ok(503),
            None => Ok(self.default_status),
        };

        {
            let mut counters = self.counters.lock().unwrap();
            if let Some(current) = counters.in_flight.get_mut(endpoint) {
                *current -= 1;
            }
        }
        reply
    }
}

/// Store whose every call fails.
pub struct UnavailableStore;

#[async_trait]
impl SubscriptionStore for UnavailableStore {
    async fn put(&self, _subscription: Subscription) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn mark_outcome(
        &self,
        _id: &SubscriptionId,
        _update: HealthUpdate,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// Store whose lookups fail while enumeration and health updates work.
pub struct LookupFailingStore {
    inner: Arc<InMemoryStore>,
}

impl LookupFailingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SubscriptionStore for LookupFailingStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.inner.put(subscription).await
    }

    async fn get(&self, _id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Err(StoreError::Unavailable("read timed out".to_string()))
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        self.inner.list_active().await
    }

    async fn mark_outcome(&self, id: &SubscriptionId, update: HealthUpdate) -> Result<(), StoreError> {
        self.inner.mark_outcome(id, update).await
    }
}

/// Encoder that refuses every payload as too large.
pub struct RefusingEncoder;

impl PayloadEncoder for RefusingEncoder {
    fn encode(
        &self,
        payload: &[u8],
        _subscription: &Subscription,
        _ttl: Duration,
    ) -> Result<WireMessage, EncodeError> {
        Err(EncodeError::PayloadTooLarge { size: payload.len(), max: 0 })
    }
}

pub async fn store_with(endpoints: &[String]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for endpoint in endpoints {
        store.put(subscription(endpoint)).await.unwrap();
    }
    store
}

pub fn dispatcher(
    config: DispatcherConfig,
    store: Arc<dyn SubscriptionStore>,
    transport: Arc<ScriptedTransport>,
) -> Dispatcher {
    Dispatcher::new(config, store, Arc::new(SignedPassthroughEncoder::new()), transport)
}
