//! Quota service implementation.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::gatekeeper::v1::{
    quota_service_server::QuotaService, CheckRequest, CheckResponse, DeleteLimitRequest,
    DeleteLimitResponse, Event, GetLimitRequest, GetLimitResponse, GetUsageRequest,
    GetUsageResponse, Limit, ListLimitsRequest, ListLimitsResponse, Reason, SetLimitRequest,
    SetLimitResponse, SortField as ProtoSortField, WatchEventsRequest,
};

use crate::error::GatekeeperError;
use crate::ratelimit::{
    BroadcastNotifier, DecisionReason, Policy, PolicySort, RateLimitEvent, RateLimiterEngine,
    SortField, UNKNOWN_CALLER,
};

/// Page size used when a listing does not ask for one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page a single listing returns.
pub const MAX_PAGE_SIZE: u32 = 1000;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send + 'static>>;

/// Implementation of the `gatekeeper.v1.QuotaService` gRPC interface.
pub struct QuotaServiceImpl {
    /// The decision engine
    engine: Arc<RateLimiterEngine>,
    /// Source for `WatchEvents`, absent when streaming is disabled
    events: Option<BroadcastNotifier>,
}

impl QuotaServiceImpl {
    /// Create a service over the given engine, without event streaming.
    pub fn new(engine: Arc<RateLimiterEngine>) -> Self {
        Self {
            engine,
            events: None,
        }
    }

    /// Serve `WatchEvents` from the given broadcast notifier.
    ///
    /// The notifier must also be one of the engine's sinks for anything to
    /// show up on the stream.
    pub fn with_events(mut self, events: BroadcastNotifier) -> Self {
        self.events = Some(events);
        self
    }
}

/// Trim a key off the wire, rejecting blank ones.
fn required_key(raw: &str) -> Result<&str, Status> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(Status::invalid_argument("api_key is required"));
    }
    Ok(key)
}

fn to_status(err: GatekeeperError) -> Status {
    match err {
        GatekeeperError::Validation(e) => Status::invalid_argument(e.to_string()),
        GatekeeperError::StoreUnavailable(e) => {
            warn!(error = %e, "Store failure while serving request");
            Status::unavailable(e.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}

fn timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn to_limit(policy: &Policy) -> Limit {
    Limit {
        api_key: policy.api_key.clone(),
        limit: policy.limit,
        window_seconds: policy.window_seconds,
        created_at: Some(timestamp(policy.created_at)),
        updated_at: Some(timestamp(policy.updated_at)),
    }
}

fn to_reason(reason: DecisionReason) -> Reason {
    match reason {
        DecisionReason::Allowed => Reason::Allowed,
        DecisionReason::Exceeded => Reason::Exceeded,
        DecisionReason::PolicyNotFound => Reason::PolicyNotFound,
    }
}

fn to_sort(field: ProtoSortField, descending: bool) -> PolicySort {
    let field = match field {
        ProtoSortField::CreatedAt => SortField::CreatedAt,
        ProtoSortField::UpdatedAt => SortField::UpdatedAt,
        ProtoSortField::ApiKey => SortField::ApiKey,
    };
    PolicySort { field, descending }
}

fn page_size(requested: u32) -> u32 {
    match requested {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    }
}

fn to_event(event: &RateLimitEvent) -> Result<Event, Status> {
    let payload = event
        .payload_json()
        .map_err(|e| Status::internal(e.to_string()))?;
    Ok(Event {
        event_id: event.event_id.to_string(),
        tag: event.kind.tag().to_string(),
        api_key: event.api_key().to_string(),
        payload,
        timestamp_millis: event.timestamp_millis(),
    })
}

#[tonic::async_trait]
impl QuotaService for QuotaServiceImpl {
    /// Create or replace the policy for a key.
    #[instrument(
        skip(self, request),
        fields(
            api_key = %request.get_ref().api_key,
            limit = request.get_ref().limit,
            window_seconds = request.get_ref().window_seconds
        )
    )]
    async fn set_limit(
        &self,
        request: Request<SetLimitRequest>,
    ) -> Result<Response<SetLimitResponse>, Status> {
        let req = request.into_inner();

        // Blank keys are left to the engine so every bad field is reported
        let upserted = self
            .engine
            .create_or_update(req.api_key.trim(), req.limit, req.window_seconds)
            .await
            .map_err(to_status)?;

        let message = if upserted.created {
            "Rate limit created successfully"
        } else {
            "Rate limit updated successfully"
        };

        Ok(Response::new(SetLimitResponse {
            limit: Some(to_limit(&upserted.policy)),
            created: upserted.created,
            message: message.to_string(),
        }))
    }

    /// Count one request against a key's window and decide on it.
    ///
    /// A rejection is a normal answer, carried in the body with an OK status.
    #[instrument(skip(self, request), fields(api_key = %request.get_ref().api_key))]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let peer = request.remote_addr();
        let req = request.into_inner();
        let api_key = required_key(&req.api_key)?;

        let caller_context = match req.caller_context.trim() {
            "" => peer
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
            context => context.to_string(),
        };

        let decision = self
            .engine
            .check_with_context(api_key, &caller_context)
            .await
            .map_err(to_status)?;

        debug!(
            allowed = decision.allowed,
            reason = %decision.reason,
            current_usage = decision.current_usage,
            "Check answered"
        );

        Ok(Response::new(CheckResponse {
            api_key: decision.api_key,
            allowed: decision.allowed,
            reason: to_reason(decision.reason).into(),
            current_usage: decision.current_usage,
            remaining_quota: decision.remaining_quota,
            window_ttl_seconds: decision.window_ttl_seconds,
            limit: decision.limit.unwrap_or(0),
        }))
    }

    /// Report a key's window without counting a request.
    #[instrument(skip(self, request), fields(api_key = %request.get_ref().api_key))]
    async fn get_usage(
        &self,
        request: Request<GetUsageRequest>,
    ) -> Result<Response<GetUsageResponse>, Status> {
        let req = request.into_inner();
        let api_key = required_key(&req.api_key)?;

        let snapshot = self
            .engine
            .usage(api_key)
            .await
            .map_err(to_status)?
            .ok_or_else(|| Status::not_found(format!("no rate limit for {}", api_key)))?;

        Ok(Response::new(GetUsageResponse {
            api_key: snapshot.api_key,
            current_usage: snapshot.current_usage,
            remaining_quota: snapshot.remaining_quota,
            window_ttl_seconds: snapshot.window_ttl_seconds,
            limit: snapshot.limit,
            window_seconds: snapshot.window_seconds,
        }))
    }

    #[instrument(skip(self, request), fields(api_key = %request.get_ref().api_key))]
    async fn get_limit(
        &self,
        request: Request<GetLimitRequest>,
    ) -> Result<Response<GetLimitResponse>, Status> {
        let req = request.into_inner();
        let api_key = required_key(&req.api_key)?;

        let policy = self
            .engine
            .get_policy(api_key)
            .await
            .map_err(to_status)?
            .ok_or_else(|| Status::not_found(format!("no rate limit for {}", api_key)))?;

        Ok(Response::new(GetLimitResponse {
            limit: Some(to_limit(&policy)),
        }))
    }

    #[instrument(skip(self, request), fields(api_key = %request.get_ref().api_key))]
    async fn delete_limit(
        &self,
        request: Request<DeleteLimitRequest>,
    ) -> Result<Response<DeleteLimitResponse>, Status> {
        let req = request.into_inner();
        let api_key = required_key(&req.api_key)?;

        if !self.engine.delete(api_key).await.map_err(to_status)? {
            return Err(Status::not_found(format!("no rate limit for {}", api_key)));
        }

        Ok(Response::new(DeleteLimitResponse { deleted: true }))
    }

    #[instrument(
        skip(self, request),
        fields(offset = request.get_ref().offset, page_size = request.get_ref().page_size)
    )]
    async fn list_limits(
        &self,
        request: Request<ListLimitsRequest>,
    ) -> Result<Response<ListLimitsResponse>, Status> {
        let req = request.into_inner();
        let sort = to_sort(req.sort(), req.descending);

        let page = self
            .engine
            .list(req.offset, page_size(req.page_size), sort)
            .await
            .map_err(to_status)?;

        Ok(Response::new(ListLimitsResponse {
            limits: page.items.iter().map(to_limit).collect(),
            total: page.total,
        }))
    }

    type WatchEventsStream = EventStream;

    /// Stream events as they are published, optionally for one key only.
    ///
    /// A subscriber that falls behind skips the events it missed.
    #[instrument(skip(self, request), fields(api_key = %request.get_ref().api_key))]
    async fn watch_events(
        &self,
        request: Request<WatchEventsRequest>,
    ) -> Result<Response<Self::WatchEventsStream>, Status> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| Status::unimplemented("event streaming is disabled"))?;

        let filter = request.into_inner().api_key.trim().to_string();
        info!(filter = %filter, "Event subscriber attached");

        let stream = BroadcastStream::new(events.subscribe()).filter_map(move |item| match item {
            Ok(event) if filter.is_empty() || event.api_key() == filter => {
                Some(to_event(&event))
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged, events dropped");
                None
            }
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
