//! # SQLite store
//!
//! Durable implementation of both store traits. Timestamps are stored as
//! unix milliseconds so due-time comparisons happen in SQL. Claims are
//! single conditional `UPDATE` statements, which keeps them atomic even when
//! several processes share the database file.
use crate::error::StoreError;
use crate::record::{DeliveryAttemptRecord, DeliveryId, DeliveryStatus};
use crate::subscription::Subscription;
use crate::traits::{DeliveryLogStore, SubscriptionStore};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id                TEXT PRIMARY KEY,
    organization_id   TEXT NOT NULL,
    url               TEXT NOT NULL,
    secret            TEXT NOT NULL,
    subscribed_events TEXT NOT NULL,
    enabled           INTEGER NOT NULL,
    extra_headers     TEXT NOT NULL,
    last_triggered_at INTEGER,
    trigger_count     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS deliveries (
    delivery_id      TEXT PRIMARY KEY,
    subscription_id  TEXT NOT NULL,
    organization_id  TEXT NOT NULL,
    event_type       TEXT NOT NULL,
    target_url       TEXT NOT NULL,
    payload          TEXT NOT NULL,
    request_headers  TEXT NOT NULL,
    status           TEXT NOT NULL,
    http_status_code INTEGER,
    response_body    TEXT,
    error_message    TEXT,
    response_time_ms INTEGER,
    attempt_number   INTEGER NOT NULL,
    max_attempts     INTEGER NOT NULL,
    next_retry_at    INTEGER,
    claimed_until    INTEGER,
    completed_at     INTEGER,
    created_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deliveries_due
    ON deliveries (status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_deliveries_subscription
    ON deliveries (subscription_id, created_at);
"#;

const DELIVERY_COLUMNS: &str = "delivery_id, subscription_id, organization_id, event_type, \
     target_url, payload, request_headers, status, http_status_code, response_body, \
     error_message, response_time_ms, attempt_number, max_attempts, next_retry_at, \
     claimed_until, completed_at, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, organization_id, url, secret, subscribed_events, \
     enabled, extra_headers, last_triggered_at, trigger_count";

/// SQLite-backed delivery log and subscription store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// `:memory:` opens a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path != Path::new(":memory:")
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "Delivery store opened");

        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a subscription (management-layer write).
    pub async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let subscription = subscription.clone();
        self.run(move |conn| {
            let mut events: Vec<&String> = subscription.subscribed_events.iter().collect();
            events.sort();
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    subscription.id,
                    subscription.organization_id,
                    subscription.url,
                    subscription.secret,
                    serde_json::to_string(&events)?,
                    subscription.enabled,
                    serde_json::to_string(&subscription.extra_headers)?,
                    subscription.last_triggered_at.map(to_millis),
                    clamp_i64(subscription.trigger_count),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a subscription. Its delivery records are left untouched.
    pub async fn remove_subscription(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::LockPoisoned(format!("SqliteStore lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn select_delivery(conn: &Connection, id: &str) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
    let record = conn
        .query_row(
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE delivery_id = ?1"),
            params![id],
            delivery_from_row,
        )
        .optional()?;
    Ok(record)
}

fn write_delivery(
    conn: &Connection,
    verb: &str,
    record: &DeliveryAttemptRecord,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        &format!(
            "{verb} INTO deliveries ({DELIVERY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            record.delivery_id.as_str(),
            record.subscription_id,
            record.organization_id,
            record.event_type,
            record.target_url,
            record.payload,
            serde_json::to_string(&record.request_headers)?,
            record.status.as_str(),
            record.http_status_code,
            record.response_body,
            record.error_message,
            record.response_time_ms.map(clamp_i64),
            record.attempt_number,
            record.max_attempts,
            record.next_retry_at.map(to_millis),
            record.claimed_until.map(to_millis),
            record.completed_at.map(to_millis),
            to_millis(record.created_at),
        ],
    )?;
    Ok(changed)
}

#[async_trait]
impl DeliveryLogStore for SqliteStore {
    async fn create(&self, record: &DeliveryAttemptRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run(move |conn| match write_delivery(conn, "INSERT", &record) {
            Ok(_) => Ok(()),
            Err(StoreError::Database(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateDelivery(record.delivery_id.to_string()))
            }
            Err(e) => Err(e),
        })
        .await
    }

    async fn update(&self, record: &DeliveryAttemptRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM deliveries WHERE delivery_id = ?1)",
                params![record.delivery_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::DeliveryNotFound(record.delivery_id.to_string()));
            }
            write_delivery(conn, "REPLACE", &record)?;
            Ok(())
        })
        .await
    }

    async fn update_claimed(
        &self,
        record: &DeliveryAttemptRecord,
        lease: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let record = record.clone();
        let lease = to_millis(lease);
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE deliveries SET \
                     status = ?2, http_status_code = ?3, response_body = ?4, \
                     error_message = ?5, response_time_ms = ?6, attempt_number = ?7, \
                     max_attempts = ?8, next_retry_at = ?9, claimed_until = ?10, \
                     completed_at = ?11 \
                 WHERE delivery_id = ?1 AND claimed_until = ?12",
                params![
                    record.delivery_id.as_str(),
                    record.status.as_str(),
                    record.http_status_code,
                    record.response_body,
                    record.error_message,
                    record.response_time_ms.map(clamp_i64),
                    record.attempt_number,
                    record.max_attempts,
                    record.next_retry_at.map(to_millis),
                    record.claimed_until.map(to_millis),
                    record.completed_at.map(to_millis),
                    lease,
                ],
            )?;
            if changed > 0 {
                return Ok(true);
            }
            match select_delivery(conn, record.delivery_id.as_str())? {
                Some(_) => Ok(false),
                None => Err(StoreError::DeliveryNotFound(record.delivery_id.to_string())),
            }
        })
        .await
    }

    async fn find_by_id(
        &self,
        id: &DeliveryId,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| select_delivery(conn, &id)).await
    }

    async fn find_due_retries(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<DeliveryAttemptRecord>, StoreError> {
        let now = to_millis(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM deliveries \
                 WHERE status = 'pending' \
                   AND ((claimed_until IS NULL AND next_retry_at IS NOT NULL AND next_retry_at <= ?1) \
                     OR (claimed_until IS NOT NULL AND claimed_until <= ?1)) \
                 ORDER BY COALESCE(claimed_until, next_retry_at) ASC \
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![now, limit], delivery_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_by_subscription(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryAttemptRecord>, StoreError> {
        let subscription_id = subscription_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM deliveries \
                 WHERE subscription_id = ?1 \
                 ORDER BY created_at DESC \
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![subscription_id, limit], delivery_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn claim(
        &self,
        id: &DeliveryId,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
        let id = id.to_string();
        let until = to_millis(now + lease);
        let now = to_millis(now);
        self.run(move |conn| {
            let claimed = conn.execute(
                "UPDATE deliveries SET claimed_until = ?1 \
                 WHERE delivery_id = ?2 AND status = 'pending' \
                   AND ((claimed_until IS NULL AND next_retry_at IS NOT NULL AND next_retry_at <= ?3) \
                     OR (claimed_until IS NOT NULL AND claimed_until <= ?3))",
                params![until, id, now],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            select_delivery(conn, &id)
        })
        .await
    }

    async fn claim_failed(
        &self,
        id: &DeliveryId,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<DeliveryAttemptRecord>, StoreError> {
        let id = id.to_string();
        let until = to_millis(now + lease);
        self.run(move |conn| {
            let claimed = conn.execute(
                "UPDATE deliveries SET \
                     status = 'pending', \
                     attempt_number = attempt_number + 1, \
                     max_attempts = MAX(max_attempts, attempt_number + 1), \
                     next_retry_at = NULL, \
                     completed_at = NULL, \
                     claimed_until = ?1 \
                 WHERE delivery_id = ?2 AND status = 'failed'",
                params![until, id],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            select_delivery(conn, &id)
        })
        .await
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            let subscription = conn
                .query_row(
                    &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
                    params![id],
                    subscription_from_row,
                )
                .optional()?;
            Ok(subscription)
        })
        .await
    }

    async fn increment_trigger_stats(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let now = to_millis(now);
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE subscriptions \
                 SET trigger_count = trigger_count + 1, last_triggered_at = ?1 \
                 WHERE id = ?2",
                params![now, id],
            )?;
            if changed == 0 {
                return Err(StoreError::SubscriptionNotFound(id));
            }
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_millis(t: OffsetDateTime) -> i64 {
    i64::try_from(t.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    let Some(ms) = row.get::<_, Option<i64>>(idx)? else {
        return Ok(None);
    };
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map(Some)
        .map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryAttemptRecord> {
    let status: String = row.get(7)?;
    let status = DeliveryStatus::parse(&status).ok_or_else(|| {
        conversion_error(
            7,
            Type::Text,
            StoreError::CorruptRow(format!("unknown delivery status '{status}'")),
        )
    })?;
    let created_at = millis_at(row, 17)?.ok_or(rusqlite::Error::InvalidColumnType(
        17,
        "created_at".to_string(),
        Type::Null,
    ))?;

    Ok(DeliveryAttemptRecord {
        delivery_id: DeliveryId::from(row.get::<_, String>(0)?),
        subscription_id: row.get(1)?,
        organization_id: row.get(2)?,
        event_type: row.get(3)?,
        target_url: row.get(4)?,
        payload: row.get(5)?,
        request_headers: json_at::<BTreeMap<String, String>>(row, 6)?,
        status,
        http_status_code: row.get(8)?,
        response_body: row.get(9)?,
        error_message: row.get(10)?,
        response_time_ms: row
            .get::<_, Option<i64>>(11)?
            .map(|ms| u64::try_from(ms).unwrap_or(0)),
        attempt_number: row.get(12)?,
        max_attempts: row.get(13)?,
        next_retry_at: millis_at(row, 14)?,
        claimed_until: millis_at(row, 15)?,
        completed_at: millis_at(row, 16)?,
        created_at,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        subscribed_events: json_at::<HashSet<String>>(row, 4)?,
        enabled: row.get(5)?,
        extra_headers: json_at::<BTreeMap<String, String>>(row, 6)?,
        last_triggered_at: millis_at(row, 7)?,
        trigger_count: u64::try_from(row.get::<_, i64>(8)?).unwrap_or(0),
    })
}
