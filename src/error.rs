use crate::domain::appeal::AppealStatus;
use crate::domain::ids::AppointmentId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed appointment data. Fails closed: no money moves.
    #[error("Policy computation error: {0}")]
    PolicyComputation(String),

    /// The gateway kept failing (or declined) after `attempts` tries.
    /// `completed_steps` counts the gateway calls of the same operation that had
    /// already succeeded before this one failed.
    #[error("Gateway {operation} failed after {attempts} attempt(s): {message}")]
    GatewayCall {
        operation: String,
        attempts: usize,
        completed_steps: usize,
        message: String,
    },

    #[error("Ledger invariant violation for appointment {appointment_id}: {detail}")]
    LedgerInvariantViolation {
        appointment_id: AppointmentId,
        detail: String,
    },

    #[error("Invalid appeal transition from {from} to {to}: {reason}")]
    InvalidAppealTransition {
        from: AppealStatus,
        to: AppealStatus,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    /// Message safe to show to the person who asked for the operation.
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::PolicyComputation(_) => {
                "Unable to complete settlement; no charges were made.".to_string()
            }
            LedgerError::GatewayCall {
                completed_steps: 0, ..
            } => "Unable to complete settlement; no charges were made.".to_string(),
            LedgerError::GatewayCall { .. } => {
                "Settlement is incomplete; completed steps were recorded \
                 and the remainder is queued for review."
                    .to_string()
            }
            LedgerError::LedgerInvariantViolation { .. } => {
                "Unable to complete settlement; the request was rejected and recorded for review."
                    .to_string()
            }
            LedgerError::InvalidAppealTransition { reason, .. } => reason.clone(),
            LedgerError::NotFound(what) => format!("Not found: {what}"),
            LedgerError::ValidationError(msg) | LedgerError::Unauthorized(msg) => msg.clone(),
            _ => "An internal error occurred.".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LedgerError::InternalError(Box::new(std::io::Error::other(message.into())))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
