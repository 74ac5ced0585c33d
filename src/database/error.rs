use thiserror::Error;

/// Errors from the control plane, the tenant registry and the migrator.
///
/// `Clone` so a single in-flight tenant open can hand the same failure to
/// every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),

    #[error("Invalid tenant schema name: {0}")]
    InvalidSchemaName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Tenant registry is closed")]
    RegistryClosed,

    #[error("Query error: {0}")]
    Query(String),
}

impl DatabaseError {
    /// True for failures that mean the database could not be reached at all
    pub fn is_connection(&self) -> bool {
        matches!(self, DatabaseError::Connection(_) | DatabaseError::RegistryClosed)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => DatabaseError::Connection(err.to_string()),
            other => DatabaseError::Query(other.to_string()),
        }
    }
}
