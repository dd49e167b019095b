//! Per-key quota policies and their store.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// The quota governing one API key: at most `limit` requests per
/// `window_seconds`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// The API key this policy applies to
    pub api_key: String,
    /// Maximum admitted requests per window
    pub limit: u32,
    /// Window length in seconds
    pub window_seconds: u32,
    /// When the policy was first stored
    pub created_at: DateTime<Utc>,
    /// When the limit or window was last replaced
    pub updated_at: DateTime<Utc>,
}

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// The policy as stored
    pub policy: Policy,
    /// True when the key had no policy before this write
    pub created: bool,
}

/// Column to order a policy listing by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Creation order
    #[default]
    CreatedAt,
    /// Last modification
    UpdatedAt,
    /// Lexicographic by key
    ApiKey,
}

/// Ordering of a policy listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicySort {
    /// Column to order by
    pub field: SortField,
    /// Largest first when set
    pub descending: bool,
}

impl PolicySort {
    /// Ascending by the given field.
    pub fn ascending(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// Descending by the given field.
    pub fn descending(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

/// One page of policies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyPage {
    /// Policies on this page
    pub items: Vec<Policy>,
    /// Number of policies across all pages
    pub total: u64,
}

/// Durable key → policy mapping.
///
/// Implementations keep at most one policy per key and make `upsert` and
/// `remove` atomic with respect to each other on the same key.
#[async_trait]
pub trait PolicyStore: Send + Sync + Debug {
    /// Fetch the key's policy, `None` when absent.
    async fn get(&self, api_key: &str) -> Result<Option<Policy>, StoreError>;

    /// Insert a policy, or replace limit and window of the existing one.
    ///
    /// Timestamps are assigned by the store: both on insert, only
    /// `updated_at` on replace.
    async fn upsert(
        &self,
        api_key: &str,
        limit: u32,
        window_seconds: u32,
    ) -> Result<Upserted, StoreError>;

    /// Remove the key's policy and return it, `None` when absent.
    async fn remove(&self, api_key: &str) -> Result<Option<Policy>, StoreError>;

    /// Remove the key's policy. Returns whether one existed.
    async fn delete(&self, api_key: &str) -> Result<bool, StoreError> {
        Ok(self.remove(api_key).await?.is_some())
    }

    /// A stable page of policies in the requested order.
    async fn list(
        &self,
        offset: u64,
        page_size: u32,
        sort: PolicySort,
    ) -> Result<PolicyPage, StoreError>;
}

/// A stored policy with its insertion sequence, used to break ordering ties.
#[derive(Debug, Clone)]
struct Row {
    policy: Policy,
    seq: u64,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<String, Row>,
    next_seq: u64,
}

/// Process-local policy store.
///
/// Everything sits behind one lock, so an upsert's exists-check and write
/// happen as a unit.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    table: RwLock<Table>,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored policies.
    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    /// True when no policies are stored.
    pub fn is_empty(&self) -> bool {
        self.table.read().rows.is_empty()
    }
}

fn compare(a: &Row, b: &Row, field: SortField) -> Ordering {
    let primary = match field {
        SortField::CreatedAt => a.policy.created_at.cmp(&b.policy.created_at),
        SortField::UpdatedAt => a.policy.updated_at.cmp(&b.policy.updated_at),
        SortField::ApiKey => a.policy.api_key.cmp(&b.policy.api_key),
    };
    primary.then(a.seq.cmp(&b.seq))
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, api_key: &str) -> Result<Option<Policy>, StoreError> {
        Ok(self.table.read().rows.get(api_key).map(|r| r.policy.clone()))
    }

    async fn upsert(
        &self,
        api_key: &str,
        limit: u32,
        window_seconds: u32,
    ) -> Result<Upserted, StoreError> {
        let now = Utc::now();
        let mut table = self.table.write();

        if let Some(row) = table.rows.get_mut(api_key) {
            row.policy.limit = limit;
            row.policy.window_seconds = window_seconds;
            row.policy.updated_at = now.max(row.policy.created_at);
            return Ok(Upserted {
                policy: row.policy.clone(),
                created: false,
            });
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        let policy = Policy {
            api_key: api_key.to_string(),
            limit,
            window_seconds,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(
            api_key.to_string(),
            Row {
                policy: policy.clone(),
                seq,
            },
        );

        Ok(Upserted {
            policy,
            created: true,
        })
    }

    async fn remove(&self, api_key: &str) -> Result<Option<Policy>, StoreError> {
        Ok(self.table.write().rows.remove(api_key).map(|r| r.policy))
    }

    async fn list(
        &self,
        offset: u64,
        page_size: u32,
        sort: PolicySort,
    ) -> Result<PolicyPage, StoreError> {
        let table = self.table.read();
        let mut rows: Vec<&Row> = table.rows.values().collect();
        rows.sort_by(|a, b| {
            let ord = compare(a, b, sort.field);
            if sort.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let items = rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(page_size as usize)
            .map(|r| r.policy.clone())
            .collect();

        Ok(PolicyPage {
            items,
            total: table.rows.len() as u64,
        })
    }
}
