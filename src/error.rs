use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlConduitError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Failed to prepare SQL: {message}\nFailing SQL: {sql}")]
    StatementError { message: String, sql: String },

    #[error("SQL execution error: {message}\nFailing SQL: {sql}")]
    ExecutionError { message: String, sql: String },

    #[error(transparent)]
    DriverError(#[from] DriverError),

    #[error("Cache store error: {0}")]
    CacheError(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Native error surfaced by a [`crate::driver::Link`] or [`crate::driver::Statement`].
///
/// The message is what the transient-failure matcher inspects, so drivers
/// should pass through the server's wording unmodified.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
