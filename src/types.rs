use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::RegistrationError;

/// Identity of a subscription: the push-service endpoint URL.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of endpoint URLs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a broadcast job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Client transport keys used by the payload encoder.
///
/// Both values are opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    /// Client public key (P-256 ECDH point).
    pub p256dh: Vec<u8>,

    /// Client authentication secret.
    pub auth: Vec<u8>,
}

/// Delivery health of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Dead,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "suspended" => Some(SubscriptionStatus::Suspended),
            "dead" => Some(SubscriptionStatus::Dead),
            _ => None,
        }
    }
}

/// A registered push subscription and its delivery health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Endpoint URL; unique key.
    pub id: SubscriptionId,

    /// Transport keys handed to the payload encoder.
    pub keys: SubscriptionKeys,

    /// Registration time, seconds since the Unix epoch.
    pub registered_at_secs: u64,

    /// Time of the last successful delivery.
    pub last_success_secs: Option<u64>,

    /// Failed deliveries since the last success.
    pub consecutive_failures: u32,

    pub status: SubscriptionStatus,
}

impl Subscription {
    /// Create a fresh, active subscription registered now.
    pub fn new(endpoint: impl Into<String>, keys: SubscriptionKeys) -> Self {
        Self {
            id: SubscriptionId::new(endpoint),
            keys,
            registered_at_secs: now_secs(),
            last_success_secs: None,
            consecutive_failures: 0,
            status: SubscriptionStatus::Active,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.id.as_str()
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// Browser-side registration payload (`PushSubscription.toJSON()`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub endpoint: String,
    pub keys: SubscriptionInfoKeys,
}

/// Base64url-encoded keys as sent by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfoKeys {
    pub p256dh: String,
    pub auth: String,
}

impl SubscriptionInfo {
    /// Validate the endpoint and decode the keys into a fresh subscription.
    pub fn into_subscription(self) -> Result<Subscription, RegistrationError> {
        let parsed = url::Url::parse(&self.endpoint)
            .map_err(|_| RegistrationError::InvalidEndpoint(self.endpoint.clone()))?;
        if !matches!(parsed.scheme(), "https" | "http") || parsed.host_str().is_none() {
            return Err(RegistrationError::InvalidEndpoint(self.endpoint));
        }

        let p256dh = decode_key(&self.keys.p256dh, "p256dh")?;
        let auth = decode_key(&self.keys.auth, "auth")?;

        Ok(Subscription::new(self.endpoint, SubscriptionKeys { p256dh, auth }))
    }
}

fn decode_key(value: &str, field: &'static str) -> Result<Vec<u8>, RegistrationError> {
    let trimmed = value.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| RegistrationError::InvalidKey { field })?;
    if bytes.is_empty() {
        return Err(RegistrationError::InvalidKey { field });
    }
    Ok(bytes)
}

/// One delivery of a broadcast payload to one subscription.
///
/// The subscription is referenced by identity only and looked up
/// by the worker at the time of the attempt.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub job_id: JobId,
    pub subscription_id: SubscriptionId,
    pub payload: Arc<[u8]>,
    pub ttl: Duration,
    pub deadline: Instant,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Set once an attempt has reached the transport.
    pub sent: bool,
    pub created_at: Instant,
}

impl DeliveryTask {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Expired after at least one send.
    ///
    /// The deadline only bounds retries: the first send is always made,
    /// carrying whatever TTL is left (possibly zero).
    pub fn lapsed(&self, now: Instant) -> bool {
        self.sent && self.is_expired(now)
    }

    /// Time left before the deadline.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// Lifecycle of a broadcast job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Cancelled,
}

/// Aggregate view of a broadcast job.
///
/// Only counts are exposed; per-subscription detail never leaves the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub total: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStatus {
    /// A job is terminal once every task has been resolved.
    pub fn is_terminal(&self) -> bool {
        self.pending == 0
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
