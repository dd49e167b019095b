//! Policy lifecycle and limit exceedance events.
//!
//! The engine hands every event to an [`EventNotifier`] after the triggering
//! store mutation has already happened. Sinks are best effort: a failed
//! publish is logged by the engine and otherwise ignored.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, trace};
use uuid::Uuid;

use super::policy::Policy;
use crate::error::NotificationError;

/// Topic all rate limit events are published under.
pub const TOPIC: &str = "rate-limit-events";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A key received its first policy
    PolicyCreated,
    /// A key's limit or window was replaced
    PolicyUpdated,
    /// A key's policy was removed
    PolicyDeleted,
    /// A check was rejected because the window is full
    LimitExceeded,
}

impl EventKind {
    /// Message tag used by downstream consumers to route the event.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::PolicyCreated => "LIMIT_CREATED",
            EventKind::PolicyUpdated => "LIMIT_UPDATED",
            EventKind::PolicyDeleted => "LIMIT_DELETED",
            EventKind::LimitExceeded => "LIMIT_EXCEEDED",
        }
    }
}

/// Body of a policy lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChange {
    /// Affected key
    pub api_key: String,
    /// Limit after the change (before it, for deletions)
    pub limit: u32,
    /// Window after the change (before it, for deletions)
    pub window_seconds: u32,
    /// `CREATED`, `UPDATED` or `DELETED`
    pub action: &'static str,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Body of a limit exceedance event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitExceeded {
    /// Affected key
    pub api_key: String,
    /// Counter value after the rejected request
    pub current_usage: u64,
    /// Limit in force
    pub limit: u32,
    /// Caller supplied context, `unknown` when none was given
    pub caller_context: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Policy lifecycle change
    PolicyChange(PolicyChange),
    /// Rejected request
    LimitExceeded(LimitExceeded),
}

/// A single published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEvent {
    /// Unique id for deduplication downstream
    pub event_id: Uuid,
    /// What happened
    pub kind: EventKind,
    /// Event body
    pub payload: EventPayload,
}

impl RateLimitEvent {
    fn policy_change(
        kind: EventKind,
        action: &'static str,
        api_key: &str,
        limit: u32,
        window_seconds: u32,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            payload: EventPayload::PolicyChange(PolicyChange {
                api_key: api_key.to_string(),
                limit,
                window_seconds,
                action,
                timestamp: Utc::now().timestamp_millis(),
            }),
        }
    }

    /// A key received its first policy.
    pub fn policy_created(policy: &Policy) -> Self {
        Self::policy_change(
            EventKind::PolicyCreated,
            "CREATED",
            &policy.api_key,
            policy.limit,
            policy.window_seconds,
        )
    }

    /// A key's policy was replaced.
    pub fn policy_updated(policy: &Policy) -> Self {
        Self::policy_change(
            EventKind::PolicyUpdated,
            "UPDATED",
            &policy.api_key,
            policy.limit,
            policy.window_seconds,
        )
    }

    /// A key's policy was removed. Limit and window are 0 when the removed
    /// policy is not known.
    pub fn policy_deleted(api_key: &str, removed: Option<&Policy>) -> Self {
        let (limit, window_seconds) = removed
            .map(|p| (p.limit, p.window_seconds))
            .unwrap_or((0, 0));
        Self::policy_change(
            EventKind::PolicyDeleted,
            "DELETED",
            api_key,
            limit,
            window_seconds,
        )
    }

    /// A check was rejected.
    pub fn limit_exceeded(
        api_key: &str,
        current_usage: u64,
        limit: u32,
        caller_context: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind: EventKind::LimitExceeded,
            payload: EventPayload::LimitExceeded(LimitExceeded {
                api_key: api_key.to_string(),
                current_usage,
                limit,
                caller_context: caller_context.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            }),
        }
    }

    /// Key the event concerns.
    pub fn api_key(&self) -> &str {
        match &self.payload {
            EventPayload::PolicyChange(p) => &p.api_key,
            EventPayload::LimitExceeded(p) => &p.api_key,
        }
    }

    /// Unix milliseconds at which the event was raised.
    pub fn timestamp_millis(&self) -> i64 {
        match &self.payload {
            EventPayload::PolicyChange(p) => p.timestamp,
            EventPayload::LimitExceeded(p) => p.timestamp,
        }
    }

    /// JSON encoding of the payload.
    pub fn payload_json(&self) -> Result<String, NotificationError> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Best-effort event sink.
///
/// Events for the same key must be delivered in the order `publish` is
/// called. Nothing stronger than at-most-once delivery is expected.
#[async_trait]
pub trait EventNotifier: Send + Sync + Debug {
    /// Publish one event.
    async fn publish(&self, event: &RateLimitEvent) -> Result<(), NotificationError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl EventNotifier for NoopNotifier {
    async fn publish(&self, _event: &RateLimitEvent) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// Writes every event to the log as a JSON body.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl EventNotifier for LogNotifier {
    async fn publish(&self, event: &RateLimitEvent) -> Result<(), NotificationError> {
        let body = event.payload_json()?;
        info!(
            topic = TOPIC,
            tag = event.kind.tag(),
            event_id = %event.event_id,
            api_key = %event.api_key(),
            body = %body,
            "Published rate limit event"
        );
        Ok(())
    }
}

/// In-process fan-out to any number of subscribers.
///
/// Each subscriber has its own bounded buffer; one that falls behind loses
/// the oldest events rather than slowing the publisher down.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Arc<RateLimitEvent>>,
}

impl BroadcastNotifier {
    /// Create a notifier buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RateLimitEvent>> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventNotifier for BroadcastNotifier {
    async fn publish(&self, event: &RateLimitEvent) -> Result<(), NotificationError> {
        // Sending with no subscribers is not a failure; nobody asked for it.
        if self.sender.send(Arc::new(event.clone())).is_err() {
            trace!(tag = event.kind.tag(), "No event subscribers");
        }
        Ok(())
    }
}

/// Publishes to several sinks concurrently.
///
/// Every sink sees every event even when another one fails; the failures
/// are reported together. Each sink still receives one key's events in
/// publish order, since `publish` completes before the next call.
#[derive(Debug, Clone, Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn EventNotifier>>,
}

impl FanoutNotifier {
    /// Create a fan-out over the given sinks.
    pub fn new(sinks: Vec<Arc<dyn EventNotifier>>) -> Self {
        Self { sinks }
    }

    /// Add a sink.
    pub fn push(&mut self, sink: Arc<dyn EventNotifier>) {
        self.sinks.push(sink);
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True when there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventNotifier for FanoutNotifier {
    async fn publish(&self, event: &RateLimitEvent) -> Result<(), NotificationError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.publish(event))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::Transport(failures.join("; ")))
        }
    }
}
