//! Gatekeeper - API Key Quota Service
//!
//! This crate implements a fixed-window request quota service. Each API key
//! carries a policy (a request limit per window), stored durably, and a
//! volatile counter for its current window. Checks count one request and
//! return an allow or deny decision; policy changes and rejections are
//! published as events. The whole surface is exposed over gRPC.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
