//! Error types for tenant-broker
//!
//! Publishing and waiting never fail. Errors only come from validating
//! input at the edges: tenant ids, cursors, configuration, and starting
//! the broker outside a runtime.

use thiserror::Error;

/// Errors that can occur while building broker inputs
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Tenant id is missing, zero, or negative
    #[error("Invalid tenant id: {0}")]
    InvalidTenant(i64),

    /// Tenant id could not be parsed from a string
    #[error("Invalid tenant id '{input}': {reason}")]
    TenantParse {
        input: String,
        reason: String,
    },

    /// Cursor is not a valid ISO-8601 timestamp
    #[error("Invalid cursor '{input}': {reason}")]
    InvalidCursor {
        input: String,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker was constructed outside a Tokio runtime
    #[error("Broker requires a running Tokio runtime")]
    NoRuntime,
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
