use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The optimistic insert kept losing the race for the next sequence number.
    #[error("Concurrency conflict on tenant {tenant_slug}: chain head moved on {attempts} attempts")]
    ConcurrencyConflict { tenant_slug: String, attempts: u32 },

    #[error("Corrupt audit record: {0}")]
    CorruptRecord(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl LedgerError {
    pub fn missing_field(field: &str) -> Self {
        Self::ValidationError(format!("{} is required and must not be empty", field))
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::ConcurrencyConflict { .. }
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
