use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::store::{apply_update, HealthUpdate, SubscriptionStore};
use crate::types::{Subscription, SubscriptionId, SubscriptionKeys, SubscriptionStatus};

const COLUMNS: &str =
    "endpoint, p256dh, auth, registered_at, last_success, consecutive_failures, status";

/// Single-file subscription store; records survive process restart.
///
/// Statements run on the blocking pool so a slow disk never stalls the
/// async workers or the retry scheduler.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    suspend_after: Option<u32>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS push_subscriptions (
                endpoint TEXT PRIMARY KEY,
                p256dh BLOB NOT NULL,
                auth BLOB NOT NULL,
                registered_at INTEGER NOT NULL,
                last_success INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            )",
            [],
        )
        .map_err(unavailable)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_push_subscriptions_status
             ON push_subscriptions(status)",
            [],
        )
        .map_err(unavailable)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            suspend_after: None,
        })
    }

    pub fn with_suspend_after(mut self, failures: u32) -> Self {
        self.suspend_after = Some(failures.max(1));
        self
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".to_string()))?;
            f(&guard).map_err(unavailable)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    let status: String = row.get(6)?;
    Ok(Subscription {
        id: SubscriptionId(row.get(0)?),
        keys: SubscriptionKeys {
            p256dh: row.get(1)?,
            auth: row.get(2)?,
        },
        registered_at_secs: row.get::<_, i64>(3)? as u64,
        last_success_secs: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        consecutive_failures: row.get::<_, i64>(5)? as u32,
        status: SubscriptionStatus::parse(&status).unwrap_or(SubscriptionStatus::Suspended),
    })
}

fn write_row(conn: &Connection, s: &Subscription) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO push_subscriptions
            (endpoint, p256dh, auth, registered_at, last_success, consecutive_failures, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            s.id.0,
            s.keys.p256dh,
            s.keys.auth,
            s.registered_at_secs as i64,
            s.last_success_secs.map(|v| v as i64),
            s.consecutive_failures as i64,
            s.status.as_str(),
        ],
    )
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.with_conn(move |conn| write_row(conn, &subscription).map(|_| ()))
            .await
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let endpoint = id.0.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM push_subscriptions WHERE endpoint = ?1"),
                [&endpoint],
                read_row,
            )
            .optional()
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM push_subscriptions WHERE status = 'active' ORDER BY endpoint"
            ))?;
            let rows = stmt.query_map([], read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    async fn mark_outcome(&self, id: &SubscriptionId, update: HealthUpdate) -> Result<(), StoreError> {
        let suspend_after = self.suspend_after;
        let endpoint = id.0.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let record = tx
                .query_row(
                    &format!("SELECT {COLUMNS} FROM push_subscriptions WHERE endpoint = ?1"),
                    [&endpoint],
                    read_row,
                )
                .optional()?;
            if let Some(mut record) = record {
                apply_update(&mut record, update, suspend_after);
                write_row(&tx, &record)?;
            }
            tx.commit()
        })
        .await
    }
}
