use std::fmt;

use thiserror::Error;

/// Errors returned when a broadcast cannot be admitted.
///
/// These are surfaced synchronously; nothing has been enqueued when
/// one of them is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Delivery queue cannot take the whole job.
    /// Caller must retry or apply backoff.
    #[error("delivery queue full: {requested} tasks requested, {available} slots available")]
    QueueFull { requested: usize, available: usize },

    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    /// Subscriptions could not be enumerated.
    #[error("subscription store unavailable: {0}")]
    StoreUnavailable(String),

    /// Payload exceeds what the encoder accepts. Not retryable.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Subscription store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid table name: {0}")]
    InvalidTable(String),
}

/// Payload encoder failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("subscription is missing transport keys")]
    MissingKeys,

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Transport-level failures that never reached an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

/// Rejected registration payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("endpoint is not an absolute http(s) URL: {0}")]
    InvalidEndpoint(String),

    #[error("key `{field}` is not valid base64url")]
    InvalidKey { field: &'static str },
}

/// Result of processing one delivery task.
///
/// Workers report outcomes as data; nothing is raised across the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Transient(TransientFailure),
    Permanent(PermanentFailure),
    /// No transport attempt was made.
    Skipped(SkipReason),
}

/// Failures that a later attempt may overcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientFailure {
    Timeout,
    Network,
    /// Push service answered 429.
    Throttled,
    ServerError(u16),
    StoreUnavailable,
}

/// Failures that no later attempt will overcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermanentFailure {
    /// Push service answered 404 or 410.
    EndpointGone(u16),
    MalformedSubscription,
    /// Any other 4xx. The task fails but the endpoint is kept.
    Rejected(u16),
    /// The payload itself cannot be sent. Says nothing about the endpoint.
    PayloadRejected,
}

impl PermanentFailure {
    /// Whether the failure proves the endpoint will never accept delivery.
    pub fn evicts(&self) -> bool {
        matches!(
            self,
            PermanentFailure::EndpointGone(_) | PermanentFailure::MalformedSubscription
        )
    }

    /// Whether the failure counts against the subscription's health.
    pub fn blames_endpoint(&self) -> bool {
        !matches!(self, PermanentFailure::PayloadRejected)
    }
}

/// Reasons a task was resolved without a transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Expired,
    Cancelled,
    /// Another attempt for the same subscription is in flight.
    Busy,
    /// Subscription missing, suspended or dead.
    Unregistered,
}

impl fmt::Display for TransientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientFailure::Timeout =>
                write!(f, "request timed out"),
            TransientFailure::Network =>
                write!(f, "network error"),
            TransientFailure::Throttled =>
                write!(f, "push service throttled the request"),
            TransientFailure::ServerError(status) =>
                write!(f, "push service returned {}", status),
            TransientFailure::StoreUnavailable =>
                write!(f, "subscription store unavailable"),
        }
    }
}

impl fmt::Display for PermanentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermanentFailure::EndpointGone(status) =>
                write!(f, "endpoint gone ({})", status),
            PermanentFailure::MalformedSubscription =>
                write!(f, "malformed subscription"),
            PermanentFailure::Rejected(status) =>
                write!(f, "push service rejected the request ({})", status),
            PermanentFailure::PayloadRejected =>
                write!(f, "payload rejected by the encoder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gone_and_malformed_evict() {
        assert!(PermanentFailure::EndpointGone(410).evicts());
        assert!(PermanentFailure::EndpointGone(404).evicts());
        assert!(PermanentFailure::MalformedSubscription.evicts());
        assert!(!PermanentFailure::Rejected(403).evicts());
        assert!(!PermanentFailure::PayloadRejected.evicts());
    }

    #[test]
    fn payload_rejection_is_not_the_endpoint_s_fault() {
        assert!(!PermanentFailure::PayloadRejected.blames_endpoint());
        assert!(PermanentFailure::Rejected(403).blames_endpoint());
        assert!(PermanentFailure::EndpointGone(410).blames_endpoint());
    }

    #[test]
    fn queue_full_reports_sizes() {
        let err = DispatchError::QueueFull { requested: 5, available: 2 };
        assert_eq!(
            err.to_string(),
            "delivery queue full: 5 tasks requested, 2 slots available"
        );
    }
}
