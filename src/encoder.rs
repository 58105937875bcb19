//! Boundary to protocol-level payload encryption.
//!
//! The engine never inspects a [`WireMessage`]; it only hands it to the
//! transport. Real Web Push encryption (RFC 8291 `aes128gcm` with VAPID
//! authorization) plugs in behind [`PayloadEncoder`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::EncodeError;
use crate::signing::{compute_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::Subscription;

/// Largest payload a push service is required to accept.
pub const MAX_PUSH_PAYLOAD: usize = 4096;

/// Encoded request body plus the headers the push service expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// `encrypt-and-sign(payload, subscription-keys) -> wire-message`.
pub trait PayloadEncoder: Send + Sync {
    fn encode(
        &self,
        payload: &[u8],
        subscription: &Subscription,
        ttl: Duration,
    ) -> Result<WireMessage, EncodeError>;

    /// Largest plaintext payload `encode` accepts.
    fn max_payload(&self) -> usize {
        MAX_PUSH_PAYLOAD
    }
}

/// Reference encoder: sends the payload unencrypted and signs it with the
/// subscription's auth secret.
///
/// Suitable for tests and for gateways that terminate encryption themselves.
/// Receivers check messages with [`crate::verify_push_message`].
#[derive(Debug, Clone)]
pub struct SignedPassthroughEncoder {
    max_payload: usize,
}

impl SignedPassthroughEncoder {
    pub fn new() -> Self {
        Self { max_payload: MAX_PUSH_PAYLOAD }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Default for SignedPassthroughEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadEncoder for SignedPassthroughEncoder {
    fn encode(
        &self,
        payload: &[u8],
        subscription: &Subscription,
        ttl: Duration,
    ) -> Result<WireMessage, EncodeError> {
        if subscription.keys.auth.is_empty() || subscription.keys.p256dh.is_empty() {
            return Err(EncodeError::MissingKeys);
        }
        if payload.len() > self.max_payload {
            return Err(EncodeError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let signature = compute_signature(&subscription.keys.auth, payload, Some(&timestamp));

        Ok(WireMessage {
            headers: vec![
                ("TTL".to_string(), ttl.as_secs().to_string()),
                ("Content-Type".to_string(), "application/octet-stream".to_string()),
                (SIGNATURE_HEADER.to_string(), signature),
                (TIMESTAMP_HEADER.to_string(), timestamp),
            ],
            body: payload.to_vec(),
        })
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}
