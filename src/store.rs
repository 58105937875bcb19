use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Subscription, SubscriptionId, SubscriptionStatus};

/// Health change applied to a subscription after a delivery resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// A delivery succeeded at the given time.
    Delivered { at_secs: u64 },
    /// A delivery failed without proving the endpoint dead.
    Failed,
    /// The endpoint will never accept delivery again.
    Evicted,
}

/// Durable mapping of endpoint identity to subscription record.
///
/// Implementations synchronize internally; callers never hold locks
/// across calls.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or replace the record keyed by `subscription.id`.
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError>;

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    /// Snapshot of every active subscription at call time.
    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Apply a health update. Unknown and dead identities are ignored.
    async fn mark_outcome(&self, id: &SubscriptionId, update: HealthUpdate) -> Result<(), StoreError>;
}

/// Apply `update` to a record in place.
///
/// Shared by every backend that loads, mutates and writes back a record.
pub(crate) fn apply_update(
    record: &mut Subscription,
    update: HealthUpdate,
    suspend_after: Option<u32>,
) {
    if record.status == SubscriptionStatus::Dead {
        return;
    }
    match update {
        HealthUpdate::Delivered { at_secs } => {
            record.last_success_secs = Some(at_secs);
            record.consecutive_failures = 0;
        }
        HealthUpdate::Failed => {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if let Some(limit) = suspend_after {
                if record.consecutive_failures >= limit {
                    record.status = SubscriptionStatus::Suspended;
                }
            }
        }
        HealthUpdate::Evicted => {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.status = SubscriptionStatus::Dead;
        }
    }
}

/// In-memory store for tests and lightweight deployments.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<SubscriptionId, Subscription>>,
    suspend_after: Option<u32>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend a subscription after `failures` consecutive failed deliveries.
    pub fn with_suspend_after(mut self, failures: u32) -> Self {
        self.suspend_after = Some(failures.max(1));
        self
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        guard.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.records.read().await;
        let mut active: Vec<Subscription> = guard
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn mark_outcome(&self, id: &SubscriptionId, update: HealthUpdate) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        if let Some(record) = guard.get_mut(id) {
            apply_update(record, update, self.suspend_after);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionKeys;

    fn sub(endpoint: &str) -> Subscription {
        Subscription::new(
            endpoint,
            SubscriptionKeys { p256dh: vec![4, 1, 2], auth: vec![9; 16] },
        )
    }

    #[tokio::test]
    async fn put_then_get_returns_the_same_record() {
        let store = InMemoryStore::new();
        let mut s = sub("https://push.example.com/a");
        s.consecutive_failures = 2;
        s.last_success_secs = Some(1_700_000_000);

        store.put(s.clone()).await.unwrap();
        assert_eq!(store.get(&s.id).await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn put_is_an_upsert() {
        let store = InMemoryStore::new();
        let first = sub("https://push.example.com/a");
        let mut second = first.clone();
        second.keys.auth = vec![1; 16];

        store.put(first).await.unwrap();
        store.put(second.clone()).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&second.id).await.unwrap().unwrap().keys.auth, vec![1; 16]);
    }

    #[tokio::test]
    async fn evicted_subscriptions_leave_list_active_immediately() {
        let store = InMemoryStore::new();
        let a = sub("https://push.example.com/a");
        let b = sub("https://push.example.com/b");
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();

        store.mark_outcome(&a.id, HealthUpdate::Evicted).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active, vec![b]);
        assert_eq!(
            store.get(&a.id).await.unwrap().unwrap().status,
            SubscriptionStatus::Dead
        );
    }

    #[tokio::test]
    async fn dead_records_ignore_later_updates_until_reregistered() {
        let store = InMemoryStore::new();
        let a = sub("https://push.example.com/a");
        store.put(a.clone()).await.unwrap();
        store.mark_outcome(&a.id, HealthUpdate::Evicted).await.unwrap();
        store
            .mark_outcome(&a.id, HealthUpdate::Delivered { at_secs: 10 })
            .await
            .unwrap();

        let dead = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(dead.status, SubscriptionStatus::Dead);
        assert_eq!(dead.last_success_secs, None);

        store.put(sub("https://push.example.com/a")).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let store = InMemoryStore::new();
        let a = sub("https://push.example.com/a");
        store.put(a.clone()).await.unwrap();

        store.mark_outcome(&a.id, HealthUpdate::Failed).await.unwrap();
        store.mark_outcome(&a.id, HealthUpdate::Failed).await.unwrap();
        assert_eq!(store.get(&a.id).await.unwrap().unwrap().consecutive_failures, 2);

        store
            .mark_outcome(&a.id, HealthUpdate::Delivered { at_secs: 42 })
            .await
            .unwrap();
        let record = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_success_secs, Some(42));
        assert_eq!(record.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn repeated_failures_suspend_when_configured() {
        let store = InMemoryStore::new().with_suspend_after(2);
        let a = sub("https://push.example.com/a");
        store.put(a.clone()).await.unwrap();

        store.mark_outcome(&a.id, HealthUpdate::Failed).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        store.mark_outcome(&a.id, HealthUpdate::Failed).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(
            store.get(&a.id).await.unwrap().unwrap().status,
            SubscriptionStatus::Suspended
        );
    }

    #[tokio::test]
    async fn unknown_identity_updates_are_ignored() {
        let store = InMemoryStore::new();
        store
            .mark_outcome(&SubscriptionId::new("https://nowhere"), HealthUpdate::Evicted)
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }
}
