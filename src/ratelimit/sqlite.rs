//! SQLite-backed policy store.
//!
//! Policies live in a single `rate_limits` table keyed by `api_key`.
//! Timestamps are stored as Unix milliseconds. All statements run on the
//! blocking pool against one connection guarded by a mutex.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::info;

use super::policy::{Policy, PolicyPage, PolicySort, PolicyStore, SortField, Upserted};
use crate::error::StoreError;

const STORE: &str = "policy store";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rate_limits (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    api_key        TEXT    NOT NULL UNIQUE,
    request_limit  INTEGER NOT NULL CHECK (request_limit >= 1),
    window_seconds INTEGER NOT NULL CHECK (window_seconds >= 1),
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rate_limits_created_at ON rate_limits (created_at);
CREATE INDEX IF NOT EXISTS idx_rate_limits_updated_at ON rate_limits (updated_at);
";

const SELECT_COLUMNS: &str =
    "SELECT api_key, request_limit, window_seconds, created_at, updated_at FROM rate_limits";

/// Raw column values of one row, decoded after the statement finishes.
type RawRow = (String, i64, i64, i64, i64);

/// Durable policy store on a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqlitePolicyStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqlitePolicyStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening sqlite policy store");

        let connection = Connection::open(path).map_err(db_error)?;
        connection
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(db_error)?;
        connection.busy_timeout(busy_timeout).map_err(db_error)?;
        Self::initialize(connection)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory().map_err(db_error)?;
        Self::initialize(connection)
    }

    fn initialize(connection: Connection) -> Result<Self, StoreError> {
        connection.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock();
            op(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend {
            store: STORE,
            message: e.to_string(),
        })?
    }
}

fn db_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            StoreError::Unavailable {
                store: STORE,
                message: err.to_string(),
            }
        }
        _ => StoreError::Backend {
            store: STORE,
            message: err.to_string(),
        },
    }
}

fn corrupt(message: String) -> StoreError {
    StoreError::Corrupt {
        store: STORE,
        message,
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn timestamp(millis: i64, api_key: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(format!("timestamp {millis} out of range for {api_key}")))
}

fn decode(raw: RawRow) -> Result<Policy, StoreError> {
    let (api_key, limit, window_seconds, created_at, updated_at) = raw;
    let limit = u32::try_from(limit)
        .map_err(|_| corrupt(format!("request_limit {limit} out of range for {api_key}")))?;
    let window_seconds = u32::try_from(window_seconds).map_err(|_| {
        corrupt(format!(
            "window_seconds {window_seconds} out of range for {api_key}"
        ))
    })?;
    let created_at = timestamp(created_at, &api_key)?;
    let updated_at = timestamp(updated_at, &api_key)?;

    Ok(Policy {
        api_key,
        limit,
        window_seconds,
        created_at,
        updated_at,
    })
}

fn order_by(sort: PolicySort) -> String {
    let column = match sort.field {
        SortField::CreatedAt => "created_at",
        SortField::UpdatedAt => "updated_at",
        SortField::ApiKey => "api_key",
    };
    let direction = if sort.descending { "DESC" } else { "ASC" };
    format!("ORDER BY {column} {direction}, id {direction}")
}

#[async_trait]
impl PolicyStore for SqlitePolicyStore {
    async fn get(&self, api_key: &str) -> Result<Option<Policy>, StoreError> {
        let api_key = api_key.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE api_key = ?1"),
                params![api_key],
                read_row,
            )
            .optional()
            .map_err(db_error)?
            .map(decode)
            .transpose()
        })
        .await
    }

    async fn upsert(
        &self,
        api_key: &str,
        limit: u32,
        window_seconds: u32,
    ) -> Result<Upserted, StoreError> {
        let api_key = api_key.to_string();
        self.run(move |conn| {
            let now = Utc::now().timestamp_millis();
            let tx = conn.transaction().map_err(db_error)?;

            let existed = tx
                .query_row(
                    "SELECT 1 FROM rate_limits WHERE api_key = ?1",
                    params![api_key],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_error)?
                .is_some();

            tx.execute(
                "INSERT INTO rate_limits
                     (api_key, request_limit, window_seconds, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(api_key) DO UPDATE SET
                     request_limit = excluded.request_limit,
                     window_seconds = excluded.window_seconds,
                     updated_at = MAX(excluded.updated_at, rate_limits.created_at)",
                params![api_key, i64::from(limit), i64::from(window_seconds), now],
            )
            .map_err(db_error)?;

            let raw = tx
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE api_key = ?1"),
                    params![api_key],
                    read_row,
                )
                .map_err(db_error)?;
            tx.commit().map_err(db_error)?;

            Ok(Upserted {
                policy: decode(raw)?,
                created: !existed,
            })
        })
        .await
    }

    async fn remove(&self, api_key: &str) -> Result<Option<Policy>, StoreError> {
        let api_key = api_key.to_string();
        self.run(move |conn| {
            conn.query_row(
                "DELETE FROM rate_limits WHERE api_key = ?1
                 RETURNING api_key, request_limit, window_seconds, created_at, updated_at",
                params![api_key],
                read_row,
            )
            .optional()
            .map_err(db_error)?
            .map(decode)
            .transpose()
        })
        .await
    }

    async fn list(
        &self,
        offset: u64,
        page_size: u32,
        sort: PolicySort,
    ) -> Result<PolicyPage, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction().map_err(db_error)?;
            let total: i64 = tx
                .query_row("SELECT COUNT(*) FROM rate_limits", [], |row| row.get(0))
                .map_err(db_error)?;

            let offset = i64::try_from(offset).unwrap_or(i64::MAX);
            let raw_rows = {
                let mut stmt = tx
                    .prepare(&format!(
                        "{SELECT_COLUMNS} {} LIMIT ?1 OFFSET ?2",
                        order_by(sort)
                    ))
                    .map_err(db_error)?;
                let rows = stmt
                    .query_map(params![i64::from(page_size), offset], read_row)
                    .map_err(db_error)?
                    .collect::<rusqlite::Result<Vec<RawRow>>>();
                rows.map_err(db_error)?
            };
            tx.commit().map_err(db_error)?;

            let items = raw_rows
                .into_iter()
                .map(decode)
                .collect::<Result<Vec<_>, _>>()?;
            let total =
                u64::try_from(total).map_err(|_| corrupt(format!("negative row count {total}")))?;

            Ok(PolicyPage { items, total })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = SqlitePolicyStore::open_in_memory().unwrap();

        let created = store.upsert("k1", 10, 60).await.unwrap();
        assert!(created.created);
        assert_eq!(created.policy.api_key, "k1");
        assert_eq!(created.policy.created_at, created.policy.updated_at);

        let updated = store.upsert("k1", 20, 120).await.unwrap();
        assert!(!updated.created);
        assert_eq!(updated.policy.limit, 20);
        assert_eq!(updated.policy.window_seconds, 120);
        assert_eq!(updated.policy.created_at, created.policy.created_at);
        assert!(updated.policy.updated_at >= created.policy.updated_at);

        assert_eq!(store.get("k1").await.unwrap(), Some(updated.policy));
        assert_eq!(store.get("k2").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_create_once() {
        let store = SqlitePolicyStore::open_in_memory().unwrap();

        let handles: Vec<_> = (0..16u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.upsert("k", i + 1, 60).await.unwrap() })
            })
            .collect();
        let results: Vec<Upserted> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|u| u.created).count(), 1);
        let created_at = results[0].policy.created_at;
        assert!(results.iter().all(|u| u.policy.created_at == created_at));

        let page = store.list(0, 10, PolicySort::default()).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_remove_and_delete() {
        let store = SqlitePolicyStore::open_in_memory().unwrap();
        store.upsert("k1", 3, 9).await.unwrap();
        store.upsert("k2", 4, 9).await.unwrap();

        let removed = store.remove("k1").await.unwrap().unwrap();
        assert_eq!(removed.limit, 3);
        assert_eq!(store.remove("k1").await.unwrap(), None);

        assert!(store.delete("k2").await.unwrap());
        assert!(!store.delete("k2").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = SqlitePolicyStore::open_in_memory().unwrap();
        for key in ["b", "a", "c"] {
            store.upsert(key, 1, 1).await.unwrap();
        }

        let page = store.list(0, 2, PolicySort::default()).await.unwrap();
        let keys: Vec<&str> = page.items.iter().map(|p| p.api_key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(page.total, 3);

        let page = store.list(2, 2, PolicySort::default()).await.unwrap();
        let keys: Vec<&str> = page.items.iter().map(|p| p.api_key.as_str()).collect();
        assert_eq!(keys, vec!["c"]);

        let page = store
            .list(0, 10, PolicySort::ascending(SortField::ApiKey))
            .await
            .unwrap();
        let keys: Vec<&str> = page.items.iter().map(|p| p.api_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_policies_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.db");

        {
            let store = SqlitePolicyStore::open(&path, Duration::from_secs(1)).unwrap();
            store.upsert("persistent", 42, 3600).await.unwrap();
        }

        let store = SqlitePolicyStore::open(&path, Duration::from_secs(1)).unwrap();
        let policy = store.get("persistent").await.unwrap().unwrap();
        assert_eq!(policy.limit, 42);
        assert_eq!(policy.window_seconds, 3600);
    }

    #[tokio::test]
    async fn test_check_constraint_surfaces_as_store_error() {
        let store = SqlitePolicyStore::open_in_memory().unwrap();

        let err = store.upsert("k1", 0, 60).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend { .. }));
    }
}
