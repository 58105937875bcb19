use std::time::Duration;

use push_dispatcher::{
    verify_push_message, PayloadEncoder, SignedPassthroughEncoder, Subscription, SubscriptionKeys,
    TIMESTAMP_HEADER,
};

fn main() {
    let auth_secret = b"0123456789abcdef".to_vec();
    let subscription = Subscription::new(
        "https://push.example.com/alice",
        SubscriptionKeys { p256dh: vec![4; 65], auth: auth_secret.clone() },
    );

    let Ok(message) = SignedPassthroughEncoder::new().encode(
        br#"{"title":"Rates"}"#,
        &subscription,
        Duration::from_secs(60),
    ) else {
        return;
    };

    // A receiver would use its own clock here.
    let now_secs = message
        .header(TIMESTAMP_HEADER)
        .and_then(|ts| ts.parse().ok())
        .unwrap_or_default();

    let result = verify_push_message(
        message.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &message.body,
        &auth_secret,
        300,
        now_secs,
    );
    println!("verification: {result:?}");
}
