use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default header carrying the hex HMAC of the payload.
pub const SIGNATURE_HEADER: &str = "X-Push-Signature";

/// Default header carrying the signing timestamp (Unix seconds).
pub const TIMESTAMP_HEADER: &str = "X-Push-Timestamp";

fn signed_bytes(payload: &[u8], timestamp: Option<&str>) -> Vec<u8> {
    match timestamp {
        Some(ts) => [ts.as_bytes(), b".", payload].concat(),
        None => payload.to_vec(),
    }
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length")
}

/// Compute the hex HMAC-SHA256 signature over `timestamp.payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let mut mac = mac_for(secret);
    mac.update(&signed_bytes(payload, timestamp));
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(&signed_bytes(payload, timestamp));
    mac.verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify a message produced by [`crate::SignedPassthroughEncoder`] in one call.
///
/// Header names are matched case-insensitively.
pub fn verify_push_message<'a, I>(
    headers: I,
    body: &[u8],
    auth_secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            signature = Some(value);
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            timestamp = Some(value);
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(auth_secret, body, Some(timestamp_str), signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
