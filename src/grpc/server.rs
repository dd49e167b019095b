//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::gatekeeper::v1::quota_service_server::QuotaServiceServer;
use super::service::QuotaServiceImpl;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{BroadcastNotifier, RateLimiterEngine};

/// gRPC server for the quota service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The decision engine
    engine: Arc<RateLimiterEngine>,
    /// Source for `WatchEvents`
    events: Option<BroadcastNotifier>,
}

impl GrpcServer {
    /// Create a new gRPC server over the given engine.
    pub fn new(addr: SocketAddr, engine: Arc<RateLimiterEngine>) -> Self {
        Self {
            addr,
            engine,
            events: None,
        }
    }

    /// Expose the notifier's events over `WatchEvents`.
    pub fn with_events(mut self, events: BroadcastNotifier) -> Self {
        self.events = Some(events);
        self
    }

    /// Address the server binds to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn service(&self) -> QuotaServiceServer<QuotaServiceImpl> {
        let mut service = QuotaServiceImpl::new(self.engine.clone());
        if let Some(events) = &self.events {
            service = service.with_events(events.clone());
        }
        QuotaServiceServer::new(service)
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        info!(
            addr = %self.addr,
            event_stream = self.events.is_some(),
            "Starting gRPC server for QuotaService"
        );

        Server::builder()
            .add_service(self.service())
            .serve(self.addr)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatekeeperError::Grpc(e)
            })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            event_stream = self.events.is_some(),
            "Starting gRPC server for QuotaService with graceful shutdown"
        );

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatekeeperError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{InMemoryCounterStore, InMemoryPolicyStore, NoopNotifier};

    fn engine() -> Arc<RateLimiterEngine> {
        Arc::new(RateLimiterEngine::new(
            Arc::new(InMemoryPolicyStore::new()),
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(NoopNotifier),
        ))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let server = GrpcServer::new(addr, engine()).with_events(BroadcastNotifier::new(8));
        assert_eq!(server.addr(), addr);
        assert!(server.events.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_server() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GrpcServer::new(addr, engine());

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
