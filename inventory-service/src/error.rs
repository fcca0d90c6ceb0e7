use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use thiserror::Error;

/// Everything that can stop a stock mutation.
///
/// Only [`FulfillmentError::TransientConflict`] is retried, and only inside
/// [`crate::retry::RetryLoop`]. Every other variant ends the attempt and is
/// reported once to whoever submitted the work.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error("transaction conflict: {0}")]
    TransientConflict(String),

    #[error("not enough stock for product_id={product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: i64,
        available: i64,
        requested: i64,
    },

    #[error("no stock record for product_id={product_id}")]
    StockNotFound { product_id: i64 },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("failed after {attempts} attempts due to serialization conflicts")]
    ConflictExhausted { attempts: u32 },

    #[error("failed to acquire database connection: {0}")]
    ConnectionFailure(String),

    #[error("database error: {0}")]
    Database(String),
}

impl FulfillmentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FulfillmentError::TransientConflict(_))
    }

    /// Whether handing the same task out again could succeed.
    pub fn is_redeliverable(&self) -> bool {
        matches!(
            self,
            FulfillmentError::TransientConflict(_)
                | FulfillmentError::ConflictExhausted { .. }
                | FulfillmentError::ConnectionFailure(_)
                | FulfillmentError::Database(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FulfillmentError::TransientConflict(_) => "transient_conflict",
            FulfillmentError::InsufficientStock { .. } => "insufficient_stock",
            FulfillmentError::StockNotFound { .. } => "stock_not_found",
            FulfillmentError::MalformedPayload(_) => "malformed_payload",
            FulfillmentError::ConflictExhausted { .. } => "conflict_exhausted",
            FulfillmentError::ConnectionFailure(_) => "connection_failure",
            FulfillmentError::Database(_) => "database",
        }
    }
}

const DEADLOCK_DETECTED: &str = "deadlock detected";

impl From<DieselError> for FulfillmentError {
    fn from(e: DieselError) -> Self {
        match e {
            // SQLSTATE 40001
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                FulfillmentError::TransientConflict(info.message().to_string())
            }
            // SQLSTATE 40P01 has no dedicated kind and arrives as Unknown
            DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)
                if info.message().starts_with(DEADLOCK_DETECTED) =>
            {
                FulfillmentError::TransientConflict(info.message().to_string())
            }
            DieselError::RollbackErrorOnCommit { commit_error, .. } => (*commit_error).into(),
            other => FulfillmentError::Database(other.to_string()),
        }
    }
}

impl From<bb8::RunError<PoolError>> for FulfillmentError {
    fn from(e: bb8::RunError<PoolError>) -> Self {
        FulfillmentError::ConnectionFailure(e.to_string())
    }
}

impl From<serde_json::Error> for FulfillmentError {
    fn from(e: serde_json::Error) -> Self {
        FulfillmentError::MalformedPayload(e.to_string())
    }
}
