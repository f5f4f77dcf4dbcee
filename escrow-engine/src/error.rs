//! Error types for the escrow system
//!
//! Every failure surfaced by approve, claim and the fraud monitor maps onto
//! one variant here, and every variant maps onto a stable machine-readable
//! code that the request surface hands back to callers.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Actor is not the party allowed to perform the operation
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Task (or its vault) does not exist
    #[error("Task {0} not found")]
    NotFound(Uuid),

    /// Status precondition violated
    #[error("Invalid state: {current} -> {requested}: {reason}")]
    InvalidState {
        current: String,
        requested: String,
        reason: String,
    },

    /// Burner wallet underfunded at approval time
    #[error("Insufficient funds: expected {expected}, found {found}")]
    InsufficientFunds { expected: String, found: String },

    /// Burner wallet drained while the task was active
    #[error("Fraud detected: {0}")]
    FraudDetected(String),

    /// Supplied unlock key does not match the issued one
    #[error("Invalid unlock key")]
    InvalidKey,

    /// Unlock key is past its expiry
    #[error("Unlock key expired")]
    ExpiredKey,

    /// Funds for this task were already released
    #[error("Funds already claimed for task {0}")]
    AlreadyClaimed(Uuid),

    /// A vault layer failed to open
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Balance query exceeded its deadline
    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    /// Balance query failed for a reason other than a timeout
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Concurrent writers kept winning the version race
    #[error("Concurrent update conflict on task {0}")]
    Conflict(Uuid),

    /// Task posting input rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(current: S, requested: S, reason: S) -> Self {
        Self::InvalidState {
            current: current.into(),
            requested: requested.into(),
            reason: reason.into(),
        }
    }

    /// Create an insufficient funds error
    pub fn insufficient_funds(expected: impl ToString, found: impl ToString) -> Self {
        Self::InsufficientFunds {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Create a fraud detected error
    pub fn fraud_detected<S: Into<String>>(msg: S) -> Self {
        Self::FraudDetected(msg.into())
    }

    /// Create a decoding error
    pub fn decoding<S: Into<String>>(msg: S) -> Self {
        Self::Decoding(msg.into())
    }

    /// Create a gateway timeout error
    pub fn gateway_timeout<S: Into<String>>(msg: S) -> Self {
        Self::GatewayTimeout(msg.into())
    }

    /// Create a gateway error
    pub fn gateway<S: Into<String>>(msg: S) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authorization(_) => "authorization_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::FraudDetected(_) => "fraud_detected",
            Self::InvalidKey => "invalid_key",
            Self::ExpiredKey => "expired_key",
            Self::AlreadyClaimed(_) => "already_claimed",
            Self::Decoding(_) => "decoding_error",
            Self::GatewayTimeout(_) => "gateway_timeout",
            Self::Gateway(_) => "gateway_error",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation_error",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Transient errors are safe to retry and never changed task state
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::GatewayTimeout(_) | Self::Gateway(_) | Self::Conflict(_)
        )
    }
}
