//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed caller input, rejected before any store is touched
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A policy or counter store could not serve a required operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Faults raised by policy and counter store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("{store} unreachable: {message}")]
    Unavailable {
        /// Which store failed
        store: &'static str,
        /// Underlying failure description
        message: String,
    },

    /// The backing store rejected or failed the operation.
    #[error("{store} backend failure: {message}")]
    Backend {
        /// Which store failed
        store: &'static str,
        /// Underlying failure description
        message: String,
    },

    /// Stored data could not be decoded.
    #[error("{store} holds corrupt data: {message}")]
    Corrupt {
        /// Which store failed
        store: &'static str,
        /// Underlying failure description
        message: String,
    },
}

/// A single rejected input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Name of the offending field
    pub field: &'static str,
    /// Human readable reason
    pub message: String,
}

/// One or more rejected input fields, reported together.
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("{}", render(.fields))]
pub struct ValidationError {
    /// Every field that failed validation, in check order
    pub fields: Vec<FieldError>,
}

impl ValidationError {
    /// Record a failed field.
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.push(FieldError {
            field,
            message: message.into(),
        });
    }

    /// True when no field failed.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Turn the collected failures into a `Result`.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn render(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to publish an event. Never escapes the engine.
#[derive(Error, Debug)]
pub enum NotificationError {
    /// The event could not be encoded.
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink refused or lost the event.
    #[error("Failed to deliver event: {0}")]
    Transport(String),
}
