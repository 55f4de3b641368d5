//! Error types for the dispatch controller.

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Could not obtain a connection from the pool.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Query failed at the database.
    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// A unique constraint rejected the write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

/// Failure taxonomy shared by the registry, the code issuer, the ledger and
/// the gateway.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Unknown agent, task, record, registration code or platform.
    #[error("{0} not found")]
    NotFound(String),

    /// Missing or unknown bearer token.
    #[error("Missing or invalid agent token")]
    Unauthorized,

    /// Valid token, but the agent has been disabled.
    #[error("Agent is disabled")]
    Forbidden,

    /// Operation is illegal for the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation blocked by live references.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Registration code past its expiry.
    #[error("Registration code has expired")]
    Expired,

    /// Registration code has no uses left.
    #[error("Registration code has no remaining uses")]
    Exhausted,

    /// Malformed or unacceptable input.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Reading a published artifact failed.
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Short machine-readable kind, used in the HTTP error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Unauthorized => "unauthorized",
            DispatchError::Forbidden => "forbidden",
            DispatchError::InvalidState(_) => "invalid_state",
            DispatchError::Conflict(_) => "conflict",
            DispatchError::Expired => "expired",
            DispatchError::Exhausted => "exhausted",
            DispatchError::Validation(_) => "validation",
            DispatchError::Database(_) => "database",
            DispatchError::Io(_) => "io",
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type for core dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
