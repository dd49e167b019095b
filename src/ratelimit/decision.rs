//! Admission decisions and usage snapshots.

use serde::Serialize;

use super::policy::Policy;

/// Why a check came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DecisionReason {
    /// Within the window's limit
    Allowed,
    /// The window is full
    Exceeded,
    /// The key has no policy
    PolicyNotFound,
}

impl DecisionReason {
    /// Human readable description.
    pub fn message(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "Request allowed",
            DecisionReason::Exceeded => "Rate limit exceeded",
            DecisionReason::PolicyNotFound => "API key not found",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Key that was checked
    pub api_key: String,
    /// Whether the request is admitted
    pub allowed: bool,
    /// Why
    pub reason: DecisionReason,
    /// Counter value after this request; 0 when the key has no policy
    pub current_usage: u64,
    /// Requests left in the window; 0 unless allowed
    pub remaining_quota: u64,
    /// Seconds until the window closes, when known
    pub window_ttl_seconds: Option<u64>,
    /// Limit in force, absent when the key has no policy
    pub limit: Option<u32>,
}

impl Decision {
    /// An admitted request.
    pub fn allowed(policy: &Policy, count: u64, window_ttl_seconds: Option<u64>) -> Self {
        Self {
            api_key: policy.api_key.clone(),
            allowed: true,
            reason: DecisionReason::Allowed,
            current_usage: count,
            remaining_quota: u64::from(policy.limit).saturating_sub(count),
            window_ttl_seconds,
            limit: Some(policy.limit),
        }
    }

    /// A rejected request. The window's remaining time is not reported.
    pub fn exceeded(policy: &Policy, count: u64) -> Self {
        Self {
            api_key: policy.api_key.clone(),
            allowed: false,
            reason: DecisionReason::Exceeded,
            current_usage: count,
            remaining_quota: 0,
            window_ttl_seconds: None,
            limit: Some(policy.limit),
        }
    }

    /// A key with no policy.
    pub fn policy_not_found(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            allowed: false,
            reason: DecisionReason::PolicyNotFound,
            current_usage: 0,
            remaining_quota: 0,
            window_ttl_seconds: None,
            limit: None,
        }
    }
}

/// Read-only view of a key's current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// Key inspected
    pub api_key: String,
    /// Requests counted in the current window
    pub current_usage: u64,
    /// Requests left in the window
    pub remaining_quota: u64,
    /// Seconds until the window closes, absent when no window is open
    pub window_ttl_seconds: Option<u64>,
    /// Limit in force
    pub limit: u32,
    /// Window length in force
    pub window_seconds: u32,
}

impl UsageSnapshot {
    /// Build a snapshot from a policy and the counter's current state.
    pub fn new(policy: &Policy, current_usage: u64, window_ttl_seconds: Option<u64>) -> Self {
        Self {
            api_key: policy.api_key.clone(),
            current_usage,
            remaining_quota: u64::from(policy.limit).saturating_sub(current_usage),
            window_ttl_seconds,
            limit: policy.limit,
            window_seconds: policy.window_seconds,
        }
    }
}
