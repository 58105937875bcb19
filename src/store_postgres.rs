use async_trait::async_trait;
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::store::{HealthUpdate, SubscriptionStore};
use crate::types::{Subscription, SubscriptionId, SubscriptionKeys, SubscriptionStatus};

/// Subscription store backed by a PostgreSQL table.
///
/// Each health update is a single `UPDATE` statement, so concurrent
/// updates for the same endpoint serialize on the row lock.
pub struct PostgresStore {
    client: Client,
    table: String,
    suspend_after: Option<u32>,
}

impl PostgresStore {
    pub async fn new(client: Client, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        if table.is_empty()
            || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            || table.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(StoreError::InvalidTable(table));
        }

        client
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        endpoint VARCHAR(2100) PRIMARY KEY,
                        p256dh BYTEA NOT NULL,
                        auth BYTEA NOT NULL,
                        registered_at BIGINT NOT NULL,
                        last_success BIGINT,
                        consecutive_failures INTEGER NOT NULL DEFAULT 0,
                        status TEXT NOT NULL
                    )"
                ),
                &[],
            )
            .await
            .map_err(unavailable)?;

        tracing::info!(table = %table, "subscription table ready");

        Ok(Self {
            client,
            table,
            suspend_after: None,
        })
    }

    pub fn with_suspend_after(mut self, failures: u32) -> Self {
        self.suspend_after = Some(failures.max(1));
        self
    }

    fn select(&self) -> String {
        format!(
            "SELECT endpoint, p256dh, auth, registered_at, last_success, consecutive_failures, status
             FROM {}",
            self.table
        )
    }
}

fn unavailable(err: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn read_row(row: &Row) -> Result<Subscription, StoreError> {
    let endpoint: String = row.try_get(0).map_err(unavailable)?;
    let status: String = row.try_get(6).map_err(unavailable)?;
    Ok(Subscription {
        id: SubscriptionId(endpoint),
        keys: SubscriptionKeys {
            p256dh: row.try_get(1).map_err(unavailable)?,
            auth: row.try_get(2).map_err(unavailable)?,
        },
        registered_at_secs: row.try_get::<_, i64>(3).map_err(unavailable)? as u64,
        last_success_secs: row
            .try_get::<_, Option<i64>>(4)
            .map_err(unavailable)?
            .map(|v| v as u64),
        consecutive_failures: row.try_get::<_, i32>(5).map_err(unavailable)? as u32,
        status: SubscriptionStatus::parse(&status).unwrap_or(SubscriptionStatus::Suspended),
    })
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (endpoint, p256dh, auth, registered_at, last_success, consecutive_failures, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (endpoint) DO UPDATE SET
                p256dh = EXCLUDED.p256dh,
                auth = EXCLUDED.auth,
                registered_at = EXCLUDED.registered_at,
                last_success = EXCLUDED.last_success,
                consecutive_failures = EXCLUDED.consecutive_failures,
                status = EXCLUDED.status",
            self.table
        );
        let registered_at = subscription.registered_at_secs as i64;
        let last_success = subscription.last_success_secs.map(|v| v as i64);
        let failures = subscription.consecutive_failures as i32;
        self.client
            .execute(
                &sql,
                &[
                    &subscription.id.0,
                    &subscription.keys.p256dh,
                    &subscription.keys.auth,
                    &registered_at,
                    &last_success,
                    &failures,
                    &subscription.status.as_str(),
                ],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let sql = format!("{} WHERE endpoint = $1", self.select());
        let row = self
            .client
            .query_opt(&sql, &[&id.0])
            .await
            .map_err(unavailable)?;
        row.as_ref().map(read_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        let sql = format!("{} WHERE status = 'active' ORDER BY endpoint", self.select());
        let rows = self.client.query(&sql, &[]).await.map_err(unavailable)?;
        rows.iter().map(read_row).collect()
    }

    async fn mark_outcome(&self, id: &SubscriptionId, update: HealthUpdate) -> Result<(), StoreError> {
        match update {
            HealthUpdate::Delivered { at_secs } => {
                let at = at_secs as i64;
                self.client
                    .execute(
                        &format!(
                            "UPDATE {} SET last_success = $2, consecutive_failures = 0
                             WHERE endpoint = $1 AND status <> 'dead'",
                            self.table
                        ),
                        &[&id.0, &at],
                    )
                    .await
                    .map_err(unavailable)?;
            }
            HealthUpdate::Failed => {
                let limit = self.suspend_after.map(|v| v as i32);
                self.client
                    .execute(
                        &format!(
                            "UPDATE {} SET
                                consecutive_failures = consecutive_failures + 1,
                                status = CASE
                                    WHEN $2::INTEGER IS NOT NULL AND consecutive_failures + 1 >= $2::INTEGER
                                    THEN 'suspended'
                                    ELSE status
                                END
                             WHERE endpoint = $1 AND status <> 'dead'",
                            self.table
                        ),
                        &[&id.0, &limit],
                    )
                    .await
                    .map_err(unavailable)?;
            }
            HealthUpdate::Evicted => {
                self.client
                    .execute(
                        &format!(
                            "UPDATE {} SET consecutive_failures = consecutive_failures + 1, status = 'dead'
                             WHERE endpoint = $1 AND status <> 'dead'",
                            self.table
                        ),
                        &[&id.0],
                    )
                    .await
                    .map_err(unavailable)?;
            }
        }
        Ok(())
    }
}
