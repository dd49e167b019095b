//! Redis-backed counter store.
//!
//! Each key maps to a Redis integer under a configurable prefix. The first
//! increment of a window sets the key's expiry; the increment and the
//! conditional `EXPIRE` run as one Lua script so no two callers can both
//! believe they opened the window.
//!
//! Read-only operations swallow Redis errors (logged as warnings) and report
//! an empty window, since they only feed reporting. Increments propagate
//! errors so a check never silently admits or rejects.

use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::{debug, warn};

use super::counter::CounterStore;
use crate::error::StoreError;

const STORE: &str = "counter store";

const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Counter store shared by every instance pointed at the same Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    increment: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

fn store_error(err: RedisError) -> StoreError {
    let unreachable = err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout();
    if unreachable {
        StoreError::Unavailable {
            store: STORE,
            message: err.to_string(),
        }
    } else {
        StoreError::Backend {
            store: STORE,
            message: err.to_string(),
        }
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url`, prefixing every key with `key_prefix`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(store_error)?;
        let connection = ConnectionManager::new(client).await.map_err(store_error)?;
        let key_prefix = key_prefix.into();
        debug!(url = %url, key_prefix = %key_prefix, "Connected redis counter store");

        Ok(Self {
            connection,
            key_prefix,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn key(&self, api_key: &str) -> String {
        format!("{}{}", self.key_prefix, api_key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, api_key: &str, window_seconds: u32) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: i64 = self
            .increment
            .key(self.key(api_key))
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        u64::try_from(count).map_err(|_| StoreError::Corrupt {
            store: STORE,
            message: format!("negative counter {count} for {api_key}"),
        })
    }

    async fn current_count(&self, api_key: &str) -> u64 {
        let mut conn = self.connection.clone();
        match conn.get::<_, Option<i64>>(self.key(api_key)).await {
            Ok(count) => count.and_then(|c| u64::try_from(c).ok()).unwrap_or(0),
            Err(e) => {
                warn!(api_key = %api_key, error = %e, "Failed to read counter");
                0
            }
        }
    }

    async fn remaining_ttl(&self, api_key: &str) -> Option<u64> {
        let mut conn = self.connection.clone();
        match conn.ttl::<_, i64>(self.key(api_key)).await {
            // -2: no such key, -1: key without expiry
            Ok(ttl) => u64::try_from(ttl).ok().filter(|t| *t > 0),
            Err(e) => {
                warn!(api_key = %api_key, error = %e, "Failed to read counter ttl");
                None
            }
        }
    }

    async fn delete(&self, api_key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.del(self.key(api_key)).await.map_err(store_error)?;
        Ok(removed > 0)
    }
}
