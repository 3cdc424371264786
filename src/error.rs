use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Application-specific error types
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid authentication token: {0}")]
    InvalidToken(String),

    #[error("Expired authentication token")]
    ExpiredToken,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Validation errors: {0}")]
    ValidationErrors(#[from] validator::ValidationErrors),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Room error: {0}")]
    Room(String),

    #[error("Annotation error: {0}")]
    Annotation(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Presence error: {0}")]
    Presence(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Cursor error: {0}")]
    Cursor(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Cluster store unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("Message dead-lettered: {0}")]
    DeadLetter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CollabError {
    /// Wire-level error code surfaced to clients in `error` frames
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::MissingToken
            | CollabError::InvalidToken(_)
            | CollabError::ExpiredToken
            | CollabError::UserNotFound(_) => "AUTH_ERROR",
            CollabError::Authorization(_) => "AUTHZ_ERROR",
            CollabError::Validation(_) | CollabError::ValidationErrors(_) => "VALIDATION_ERROR",
            CollabError::Conflict(_) => "CONFLICT_ERROR",
            CollabError::RateLimited => "RATE_LIMIT_ERROR",
            CollabError::Connection(_)
            | CollabError::CircuitOpen(_)
            | CollabError::ClusterUnavailable(_) => "CONNECTION_ERROR",
            CollabError::RoomFull(_) | CollabError::Room(_) => "ROOM_ERROR",
            CollabError::Annotation(_) => "ANNOTATION_ERROR",
            CollabError::Transform(_) => "TRANSFORM_ERROR",
            CollabError::Queue(_) | CollabError::DeadLetter(_) => "QUEUE_ERROR",
            CollabError::Presence(_) => "PRESENCE_ERROR",
            CollabError::Notification(_) => "NOTIFICATION_ERROR",
            CollabError::Cursor(_) => "CURSOR_ERROR",
            CollabError::Timeout(_) => "TIMEOUT_ERROR",
            CollabError::Config(_)
            | CollabError::HttpClient(_)
            | CollabError::JsonSerialization(_)
            | CollabError::Io(_)
            | CollabError::Internal(_) => "UNKNOWN_ERROR",
        }
    }

    /// Build the outbound error frame for this error
    pub fn to_frame(&self, context: Option<serde_json::Value>) -> ErrorFrame {
        ErrorFrame {
            error: true,
            code: self.code().to_string(),
            message: self.to_string(),
            context,
            timestamp: Utc::now(),
        }
    }

    /// Log this error with additional context information
    pub fn log_with_context(&self, context: &str) {
        tracing::error!(code = self.code(), "{}: {}", context, self);
        crate::metrics::record_error(self.code());
    }
}

/// Error frame sent to clients: `{error: true, code, message, context?, timestamp}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub timestamp: chrono::DateTime<Utc>,
}

impl ErrorFrame {
    pub fn with_event(error: &CollabError, event: &str) -> Self {
        error.to_frame(Some(json!({ "event": event })))
    }
}

/// Result type alias for application operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Helper trait for converting foreign errors into validation failures
pub trait ValidationErrorExt<T> {
    fn validation_error(self, message: &str) -> CollabResult<T>;
}

impl<T, E> ValidationErrorExt<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn validation_error(self, message: &str) -> CollabResult<T> {
        self.map_err(|e| CollabError::Validation(format!("{}: {}", message, e)))
    }
}

impl From<jsonwebtoken::errors::Error> for CollabError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CollabError::ExpiredToken,
            _ => CollabError::InvalidToken(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for CollabError {
    fn from(err: redis::RedisError) -> Self {
        CollabError::ClusterUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CollabError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CollabError::Timeout("deadline elapsed".to_string())
    }
}
