//! gRPC surface for the quota engine.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::QuotaServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod gatekeeper {
        pub mod v1 {
            tonic::include_proto!("gatekeeper.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::gatekeeper::v1::{
    quota_service_server::QuotaServiceServer, CheckRequest, CheckResponse, SetLimitRequest,
    SetLimitResponse,
};
