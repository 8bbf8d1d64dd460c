//! Error types for the application

use thiserror::Error;

/// Result type alias using our TraderError
pub type Result<T> = std::result::Result<T, TraderError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum TraderError {
    /// WebSocket connection errors
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    /// WebSocket send/receive errors
    #[error("WebSocket communication error: {0}")]
    WebSocketCommunication(String),

    /// Streaming handshake refused by the server
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    /// HTTP request errors
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded: {message}, retry after {retry_after_seconds:?} seconds")]
    RateLimit {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    /// Invalid API response
    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    /// Broker answered with a non-success status code
    #[error("Broker rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },

    /// Snapshot that contradicts known local state
    #[error("Suspect broker data: {0}")]
    SuspectData(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Channel send errors
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TraderError {
    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TraderError::Timeout(_)
            | TraderError::RateLimit { .. }
            | TraderError::WebSocketConnection(_)
            | TraderError::WebSocketCommunication(_) => true,
            TraderError::HttpRequest(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map_or(false, |s| s.is_server_error())
            }
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TraderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TraderError::WebSocketCommunication(err.to_string())
    }
}

impl From<url::ParseError> for TraderError {
    fn from(err: url::ParseError) -> Self {
        TraderError::Configuration(format!("invalid url: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TraderError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        TraderError::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TraderError::Timeout("balance".into()).is_transient());
        assert!(TraderError::RateLimit {
            message: "slow down".into(),
            retry_after_seconds: Some(1),
        }
        .is_transient());
        assert!(!TraderError::Configuration("bad".into()).is_transient());
        assert!(!TraderError::Rejected {
            code: "2000".into(),
            message: "insufficient margin".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_rejected_display() {
        let err = TraderError::Rejected {
            code: "800033".into(),
            message: "no sellable quantity".into(),
        };
        assert_eq!(
            err.to_string(),
            "Broker rejected request [800033]: no sellable quantity"
        );
    }
}
