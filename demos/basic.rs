use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use push_dispatcher::{
    Dispatcher, DispatcherConfig, InMemoryStore, PushTransport, SignedPassthroughEncoder,
    SubscriptionInfo, SubscriptionInfoKeys, SubscriptionStore, TransportError, WireMessage,
};

/// Prints each message instead of calling a push service.
struct ConsoleTransport;

#[async_trait]
impl PushTransport for ConsoleTransport {
    async fn send(&self, endpoint: &str, message: &WireMessage) -> Result<u16, TransportError> {
        println!(
            "{endpoint} ttl={} body={}",
            message.header("TTL").unwrap_or("-"),
            String::from_utf8_lossy(&message.body)
        );
        Ok(201)
    }
}

#[tokio::main]
async fn main() {
    push_dispatcher::logging::init();

    let store = Arc::new(InMemoryStore::new());
    for name in ["alice", "bob"] {
        let info = SubscriptionInfo {
            endpoint: format!("https://push.example.com/{name}"),
            keys: SubscriptionInfoKeys {
                p256dh: "BOr1bGk".to_string(),
                auth: "c2VjcmV0".to_string(),
            },
        };
        if let Ok(subscription) = info.into_subscription() {
            let _ = store.put(subscription).await;
        }
    }

    let dispatcher = Dispatcher::new(
        DispatcherConfig::default(),
        store,
        Arc::new(SignedPassthroughEncoder::new()),
        Arc::new(ConsoleTransport),
    );

    if let Ok(job_id) = dispatcher
        .broadcast(r#"{"title":"Rates","body":"1.2k per day"}"#, Duration::from_secs(60))
        .await
    {
        if let Some(status) = dispatcher.wait_for_job(&job_id).await {
            println!("job {job_id}: {}/{} delivered", status.succeeded, status.total);
        }
    }

    dispatcher.shutdown().await;
}
