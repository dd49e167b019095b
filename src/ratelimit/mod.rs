//! Rate limiting policies, window counters and the decision engine.

mod clock;
mod counter;
mod decision;
mod engine;
mod events;
mod policy;
#[cfg(feature = "redis-store")]
mod redis_store;
mod sqlite;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{CounterStore, InMemoryCounterStore};
pub use decision::{Decision, DecisionReason, UsageSnapshot};
pub use engine::{RateLimiterEngine, MAX_API_KEY_LEN, UNKNOWN_CALLER};
pub use events::{
    BroadcastNotifier, EventKind, EventNotifier, EventPayload, FanoutNotifier, LimitExceeded,
    LogNotifier, NoopNotifier, PolicyChange, RateLimitEvent, TOPIC,
};
pub use policy::{
    InMemoryPolicyStore, Policy, PolicyPage, PolicySort, PolicyStore, SortField, Upserted,
};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisCounterStore;
pub use sqlite::SqlitePolicyStore;
