use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the sparrow-dispatch service
#[derive(Debug)]
pub enum DispatchError {
    // Caller errors
    InvalidInput(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),

    // Ride lifecycle errors
    InvalidTransition { from: String, to: String },
    RideNotFound(String),
    RideNotCancellable(String),
    MatchRejected(String),

    // Driver errors
    DriverNotFound(String),
    DriverBanned(String),
    DriverNotAvailable(String),

    // Store errors
    Store(String),
    StoreTimeout,

    // Broker errors
    Publish(String),
    BrokerUnavailable,

    // Realtime session errors
    SessionGone(String),
    ChannelClosed,

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),
    InvalidFormat(String),

    // Validation errors
    ValidationFailed(Vec<ValidationError>),

    // Configuration and setup errors
    Configuration(String),

    // Everything else
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
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
            DispatchError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            DispatchError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            DispatchError::NotFound(msg) => write!(f, "Not found: {}", msg),
            DispatchError::Conflict(msg) => write!(f, "Conflict: {}", msg),

            DispatchError::InvalidTransition { from, to } => {
                write!(f, "Invalid ride transition: {} -> {}", from, to)
            }
            DispatchError::RideNotFound(id) => write!(f, "Ride not found: {}", id),
            DispatchError::RideNotCancellable(status) => {
                write!(f, "Ride cannot be cancelled from status {}", status)
            }
            DispatchError::MatchRejected(msg) => write!(f, "Match rejected: {}", msg),

            DispatchError::DriverNotFound(id) => write!(f, "Driver not found: {}", id),
            DispatchError::DriverBanned(id) => write!(f, "Driver is banned: {}", id),
            DispatchError::DriverNotAvailable(id) => write!(f, "Driver is not available: {}", id),

            DispatchError::Store(msg) => write!(f, "Store error: {}", msg),
            DispatchError::StoreTimeout => write!(f, "Store operation timed out"),

            DispatchError::Publish(msg) => write!(f, "Publish error: {}", msg),
            DispatchError::BrokerUnavailable => write!(f, "Message broker is unavailable"),

            DispatchError::SessionGone(driver_id) => {
                write!(f, "No live session for driver: {}", driver_id)
            }
            DispatchError::ChannelClosed => write!(f, "Communication channel closed"),

            DispatchError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            DispatchError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),
            DispatchError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),

            DispatchError::ValidationFailed(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }

            DispatchError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            DispatchError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, error_type, message, details) = match self {
            DispatchError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg, None),
            DispatchError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            DispatchError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            DispatchError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),

            DispatchError::InvalidTransition { ref from, ref to } => (
                StatusCode::CONFLICT,
                "invalid_transition",
                format!("Invalid ride transition: {} -> {}", from, to),
                None,
            ),
            DispatchError::RideNotFound(id) => {
                (StatusCode::NOT_FOUND, "ride_not_found", format!("Ride not found: {}", id), None)
            }
            DispatchError::RideNotCancellable(status) => (
                StatusCode::CONFLICT,
                "ride_not_cancellable",
                format!("Ride cannot be cancelled from status {}", status),
                None,
            ),
            DispatchError::MatchRejected(msg) => (StatusCode::CONFLICT, "match_rejected", msg, None),

            DispatchError::DriverNotFound(id) => (
                StatusCode::NOT_FOUND,
                "driver_not_found",
                format!("Driver not found: {}", id),
                None,
            ),
            DispatchError::DriverBanned(id) => (
                StatusCode::FORBIDDEN,
                "driver_banned",
                format!("Driver is banned: {}", id),
                None,
            ),
            DispatchError::DriverNotAvailable(id) => (
                StatusCode::CONFLICT,
                "driver_not_available",
                format!("Driver is not available: {}", id),
                None,
            ),

            DispatchError::ValidationFailed(errors) => {
                let details = serde_json::to_value(&errors).ok();
                (
                    StatusCode::BAD_REQUEST,
                    "validation_failed",
                    "Validation errors occurred".to_string(),
                    details,
                )
            }

            DispatchError::BrokerUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "broker_unavailable",
                "Message broker is unavailable".to_string(),
                None,
            ),

            // All other errors are treated as internal server errors
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", self.to_string(), None),
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type DispatchResult<T> = Result<T, DispatchError>;

// Conversion implementations for common error types
impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DispatchError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => DispatchError::StoreTimeout,
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                DispatchError::Conflict(db_err.to_string())
            }
            _ => DispatchError::Store(err.to_string()),
        }
    }
}

impl From<lapin::Error> for DispatchError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
                DispatchError::BrokerUnavailable
            }
            _ => DispatchError::Publish(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            DispatchError::JsonParsing(err.to_string())
        } else {
            DispatchError::JsonSerialization(err.to_string())
        }
    }
}

impl From<uuid::Error> for DispatchError {
    fn from(err: uuid::Error) -> Self {
        DispatchError::InvalidFormat(format!("Invalid UUID: {}", err))
    }
}

// Helper functions for creating common errors
impl DispatchError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        DispatchError::InvalidInput(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        DispatchError::Forbidden(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        DispatchError::NotFound(resource.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DispatchError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DispatchError::Internal(msg.into())
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        DispatchError::InvalidTransition { from: from.into(), to: to.into() }
    }

    /// Transient store failures are worth another attempt; caller errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::StoreTimeout | DispatchError::Store(_))
    }
}
