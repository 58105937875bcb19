//! A single-process Web Push broadcast delivery engine.
//!
//! This crate fans one payload out to every active push subscription
//! through a **bounded** queue and a fixed pool of delivery workers.
//!
//! ## Guarantees
//! - Bounded resource usage
//! - Explicit backpressure (`QueueFull`, never a silent drop)
//! - Per-origin rate limiting
//! - At most one in-flight attempt per subscription
//! - Best-effort, at-least-once delivery with exponential backoff
//! - Dead endpoints (404/410) are evicted after one attempt
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Durability of queued work across restarts
//! - Distributed coordination
//!
//! Payload encryption is not implemented here: it plugs in behind
//! [`PayloadEncoder`]. Subscriptions persist through a
//! [`SubscriptionStore`] backend.

mod dispatcher;
mod encoder;
mod error;
mod jobs;
mod rate_limit;
mod scheduler;
mod signing;
mod store;
mod transport;
mod types;
mod worker;

pub mod config;
pub mod logging;

#[cfg(feature = "sqlite")]
mod store_sqlite;

#[cfg(feature = "postgres")]
mod store_postgres;

#[cfg(feature = "server")]
pub mod server;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use encoder::{PayloadEncoder, SignedPassthroughEncoder, WireMessage, MAX_PUSH_PAYLOAD};
pub use error::{
    DeliveryOutcome,
    DispatchError,
    EncodeError,
    PermanentFailure,
    RegistrationError,
    SkipReason,
    StoreError,
    TransientFailure,
    TransportError,
};
pub use rate_limit::{origin_of, Permit, RateLimit, RateLimiter, RateLimiterStats};
pub use signing::{
    compute_signature,
    is_timestamp_fresh,
    verify_push_message,
    verify_signature,
    VerificationError,
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use store::{HealthUpdate, InMemoryStore, SubscriptionStore};
pub use transport::{classify, PushTransport};
pub use types::{
    DeliveryTask,
    JobId,
    JobState,
    JobStatus,
    Subscription,
    SubscriptionId,
    SubscriptionInfo,
    SubscriptionInfoKeys,
    SubscriptionKeys,
    SubscriptionStatus,
};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
