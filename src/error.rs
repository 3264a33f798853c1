//! Error types for qail-serverless.
//!
//! Callers must be able to tell "the server rejected my query"
//! ([`ServerlessError::Database`]) apart from "something between us is broken"
//! (every other variant, [`ServerlessError::MalformedResponse`] in particular).

use thiserror::Error;

/// Boxed error carried as the underlying cause of a [`DatabaseError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for serverless operations.
#[derive(Debug, Error)]
pub enum ServerlessError {
    /// WebSocket could not be opened or closed before the expected state.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error reported by the WebSocket implementation.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// TLS handshake or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Client and server disagree about where they are in the protocol.
    /// Always fatal to the connection.
    #[error("Protocol desynchronized: {0}")]
    ProtocolDesync(String),

    /// Malformed wire-protocol message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SCRAM validation failure. Aborts authentication.
    #[error("SASL: {0}")]
    Scram(String),

    /// Server-reported Postgres error.
    #[error(transparent)]
    Database(Box<DatabaseError>),

    /// HTTP response body did not have the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Invalid configuration or arguments.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request could not be built.
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerlessError {
    /// Create a SCRAM error.
    pub fn scram(message: impl Into<String>) -> Self {
        Self::Scram(message.into())
    }

    /// Create a protocol desync error.
    pub fn desync(message: impl Into<String>) -> Self {
        Self::ProtocolDesync(message.into())
    }

    /// The server-reported error, if this is one.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match self {
            Self::Database(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE code of a server-reported error.
    pub fn code(&self) -> Option<&str> {
        self.as_database().and_then(|e| e.code.as_deref())
    }
}

impl From<DatabaseError> for ServerlessError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

/// A Postgres error with all standard diagnostic fields.
///
/// Produced both by the socket path (from `ErrorResponse` messages) and the
/// HTTP path (from error bodies or transport failures).
#[derive(Debug, Default, Error)]
#[error("{message}")]
pub struct DatabaseError {
    pub message: String,
    pub severity: Option<String>,
    pub code: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub r#where: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
    /// Underlying transport failure, when there is one.
    #[source]
    pub source_error: Option<BoxError>,
}

impl DatabaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Wrap a transport failure that prevented the request from completing.
    pub fn connecting(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self {
            message: format!("Error connecting to database: {}", source),
            source_error: Some(source),
            ..Default::default()
        }
    }

    /// FATAL or PANIC severity; the server closes the connection after these.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL") | Some("PANIC"))
    }
}

/// Result type alias for serverless operations.
pub type ServerlessResult<T> = Result<T, ServerlessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerlessError::scram("server nonce is too short");
        assert_eq!(err.to_string(), "SASL: server nonce is too short");

        let mut db = DatabaseError::new("relation \"nope\" does not exist");
        db.code = Some("42P01".to_string());
        let err = ServerlessError::from(db);
        assert_eq!(err.to_string(), "relation \"nope\" does not exist");
        assert_eq!(err.code(), Some("42P01"));
    }

    #[test]
    fn test_connecting_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let db = DatabaseError::connecting(io);
        assert!(db.message.starts_with("Error connecting to database"));
        assert!(std::error::Error::source(&db).is_some());
    }

    #[test]
    fn test_fatal_severity() {
        let mut db = DatabaseError::new("password authentication failed");
        assert!(!db.is_fatal());
        db.severity = Some("FATAL".to_string());
        assert!(db.is_fatal());
    }
}
