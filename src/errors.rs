use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the dispatch core
#[derive(Debug)]
pub enum DispatchError {
    // Input errors
    ValidationFailed(Vec<ValidationError>),

    // Entity state errors
    PreconditionFailed(String),
    InvalidTransition { from: String, to: String },
    NotFound { entity: &'static str, id: String },
    Duplicate { entity: &'static str, id: String },

    // Ledger errors
    InsufficientBalance { required: i64, available: i64 },
    WalletFrozen(String),
    ConcurrencyConflict(String),

    // Security errors
    Unauthorized(String),
    Forbidden(String),

    // Store errors
    StoreTimeout,
    Store(String),
    Serialization(String),

    // Collaborator and transport errors
    Network(String),
    Configuration(String),
    Realtime(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ValidationFailed(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }
            DispatchError::PreconditionFailed(msg) => write!(f, "Precondition failed: {}", msg),
            DispatchError::InvalidTransition { from, to } => {
                write!(f, "Invalid status transition from {} to {}", from, to)
            }
            DispatchError::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            DispatchError::Duplicate { entity, id } => write!(f, "{} already exists: {}", entity, id),
            DispatchError::InsufficientBalance { required, available } => write!(
                f,
                "Insufficient balance: {} coins required, {} available",
                required, available
            ),
            DispatchError::WalletFrozen(user_id) => write!(f, "Wallet is frozen: {}", user_id),
            DispatchError::ConcurrencyConflict(msg) => write!(f, "Concurrent modification: {}", msg),
            DispatchError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            DispatchError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            DispatchError::StoreTimeout => write!(f, "Store operation timed out"),
            DispatchError::Store(msg) => write!(f, "Store error: {}", msg),
            DispatchError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            DispatchError::Network(msg) => write!(f, "Network error: {}", msg),
            DispatchError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            DispatchError::Realtime(msg) => write!(f, "Realtime delivery error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    /// Stable machine-readable code handed to the operator-facing layer
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::ValidationFailed(_) => "validation_failed",
            DispatchError::PreconditionFailed(_) => "precondition_failed",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::NotFound { .. } => "not_found",
            DispatchError::Duplicate { .. } => "duplicate",
            DispatchError::InsufficientBalance { .. } => "insufficient_balance",
            DispatchError::WalletFrozen(_) => "wallet_frozen",
            DispatchError::ConcurrencyConflict(_) => "concurrency_conflict",
            DispatchError::Unauthorized(_) => "unauthorized",
            DispatchError::Forbidden(_) => "forbidden",
            DispatchError::StoreTimeout => "store_timeout",
            DispatchError::Store(_) => "store_error",
            DispatchError::Serialization(_) => "serialization_error",
            DispatchError::Network(_) => "network_error",
            DispatchError::Configuration(_) => "configuration_error",
            DispatchError::Realtime(_) => "realtime_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            DispatchError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            DispatchError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DispatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::Duplicate { .. } => StatusCode::CONFLICT,
            DispatchError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            DispatchError::WalletFrozen(_) => StatusCode::FORBIDDEN,
            DispatchError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            DispatchError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DispatchError::Forbidden(_) => StatusCode::FORBIDDEN,
            DispatchError::StoreTimeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Network(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors the caller caused; everything else is logged as a fault
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, details) = match &self {
            DispatchError::ValidationFailed(errors) => (
                "Validation errors occurred".to_string(),
                serde_json::to_value(errors).ok(),
            ),
            DispatchError::InsufficientBalance { required, available } => (
                self.to_string(),
                Some(serde_json::json!({ "required": required, "available": available })),
            ),
            DispatchError::InvalidTransition { from, to } => (
                self.to_string(),
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            // Internal details stay in the logs
            _ if status.is_server_error() => {
                tracing::error!("Internal dispatch error: {}", self);
                ("Internal error".to_string(), None)
            }
            _ => (self.to_string(), None),
        };

        let error_response = ErrorResponse {
            error: self.code().to_string(),
            message,
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type DispatchResult<T> = Result<T, DispatchError>;

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            DispatchError::StoreTimeout
        } else {
            DispatchError::Store(err.to_string())
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DispatchError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DispatchError::StoreTimeout
    }
}

// Helper functions for creating common errors
impl DispatchError {
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        DispatchError::PreconditionFailed(msg.into())
    }

    pub fn order_not_found(order_id: impl Into<String>) -> Self {
        DispatchError::NotFound { entity: "Order", id: order_id.into() }
    }

    pub fn driver_not_found(driver_id: impl Into<String>) -> Self {
        DispatchError::NotFound { entity: "Driver", id: driver_id.into() }
    }

    pub fn vehicle_not_found(vehicle_id: impl Into<String>) -> Self {
        DispatchError::NotFound { entity: "Vehicle", id: vehicle_id.into() }
    }

    pub fn wallet_not_found(user_id: impl Into<String>) -> Self {
        DispatchError::NotFound { entity: "Wallet", id: user_id.into() }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        DispatchError::Unauthorized(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DispatchError::order_not_found("ord-231207-a1b2c");
        assert_eq!(error.to_string(), "Order not found: ord-231207-a1b2c");

        let error = DispatchError::InvalidTransition {
            from: "PENDING".to_string(),
            to: "COMPLETED".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid status transition from PENDING to COMPLETED");
    }

    #[test]
    fn test_validation_error() {
        let error = DispatchError::validation_error("total_fare", "does not match parts");
        match error {
            DispatchError::ValidationFailed(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "total_fare");
            }
            _ => panic!("Expected ValidationFailed error"),
        }
    }

    #[test]
    fn test_codes_and_classes() {
        assert_eq!(DispatchError::StoreTimeout.code(), "store_timeout");
        assert!(DispatchError::precondition("busy").is_client_error());
        assert!(DispatchError::ConcurrencyConflict("v1".into()).is_client_error());
        assert!(!DispatchError::Store("down".into()).is_client_error());
        let taken = DispatchError::Duplicate { entity: "Order", id: "ord-1".into() };
        assert_eq!(taken.code(), "duplicate");
        assert!(taken.is_client_error());
    }
}
