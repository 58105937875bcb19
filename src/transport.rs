use async_trait::async_trait;

use crate::encoder::WireMessage;
use crate::error::{DeliveryOutcome, PermanentFailure, TransientFailure, TransportError};

/// Network leg of a delivery attempt.
///
/// Returns the HTTP status the push service answered with; timeouts and
/// connection failures are `Err`. Implementations must not retry.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, endpoint: &str, message: &WireMessage) -> Result<u16, TransportError>;
}

/// Map a transport result onto the delivery outcome taxonomy.
pub fn classify(result: Result<u16, TransportError>) -> DeliveryOutcome {
    match result {
        Ok(status) if (200..300).contains(&status) => DeliveryOutcome::Delivered,
        Ok(status @ (404 | 410)) => DeliveryOutcome::Permanent(PermanentFailure::EndpointGone(status)),
        Ok(400) => DeliveryOutcome::Permanent(PermanentFailure::MalformedSubscription),
        Ok(429) => DeliveryOutcome::Transient(TransientFailure::Throttled),
        Ok(status) if status >= 500 => DeliveryOutcome::Transient(TransientFailure::ServerError(status)),
        Ok(status) => DeliveryOutcome::Permanent(PermanentFailure::Rejected(status)),
        Err(TransportError::Timeout) => DeliveryOutcome::Transient(TransientFailure::Timeout),
        Err(TransportError::Network(_)) => DeliveryOutcome::Transient(TransientFailure::Network),
    }
}

/// HTTP transport for real push services.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl PushTransport for HttpTransport {
    async fn send(&self, endpoint: &str, message: &WireMessage) -> Result<u16, TransportError> {
        let mut request = self.client.post(endpoint).body(message.body.clone());
        for (name, value) in &message.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(err) if err.is_timeout() => Err(TransportError::Timeout),
            Err(err) => Err(TransportError::Network(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses() {
        assert_eq!(classify(Ok(200)), DeliveryOutcome::Delivered);
        assert_eq!(classify(Ok(201)), DeliveryOutcome::Delivered);
    }

    #[test]
    fn gone_endpoints_are_permanent() {
        assert_eq!(
            classify(Ok(410)),
            DeliveryOutcome::Permanent(PermanentFailure::EndpointGone(410))
        );
        assert_eq!(
            classify(Ok(404)),
            DeliveryOutcome::Permanent(PermanentFailure::EndpointGone(404))
        );
        assert_eq!(
            classify(Ok(400)),
            DeliveryOutcome::Permanent(PermanentFailure::MalformedSubscription)
        );
        assert_eq!(
            classify(Ok(403)),
            DeliveryOutcome::Permanent(PermanentFailure::Rejected(403))
        );
    }

    #[test]
    fn overload_and_network_are_transient() {
        assert_eq!(
            classify(Ok(429)),
            DeliveryOutcome::Transient(TransientFailure::Throttled)
        );
        assert_eq!(
            classify(Ok(503)),
            DeliveryOutcome::Transient(TransientFailure::ServerError(503))
        );
        assert_eq!(
            classify(Err(TransportError::Timeout)),
            DeliveryOutcome::Transient(TransientFailure::Timeout)
        );
        assert_eq!(
            classify(Err(TransportError::Network("reset".into()))),
            DeliveryOutcome::Transient(TransientFailure::Network)
        );
    }
}
