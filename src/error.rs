use sqlx::Error as SqlxError;
use std::fmt;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum InfraError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema validation failed for table `{table}`: {reason}")]
    SchemaValidation { table: String, reason: String },

    #[error("Table `{0}` is not managed by this persistence unit")]
    UnmanagedEntity(&'static str),

    #[error("Writing large objects into `{0}` requires an active unit of work")]
    LobOutsideUnitOfWork(&'static str),

    #[error("{0} must share the data source instance of the persistence unit")]
    DataSourceMismatch(&'static str),

    #[error("Unable to claim token for processor `{processor}` segment {segment}: {reason}")]
    UnableToClaimToken {
        processor: String,
        segment: i32,
        reason: String,
    },

    #[error("Unable to initialize tokens for processor `{processor}`: {reason}")]
    UnableToInitializeTokens { processor: String, reason: String },

    #[error("Missing required component: {0}")]
    MissingComponent(&'static str),

    #[error("No snapshot builder registered for aggregate type `{0}`")]
    UnknownAggregateType(String),

    #[error("Snapshotter worker is not running")]
    SnapshotterStopped,

    #[error("Snapshotter has already been created by this factory")]
    SnapshotterAlreadyCreated,

    #[error("Snapshotter worker failed to start: {0}")]
    SnapshotterSpawn(#[from] std::io::Error),
}

/// Errors raised while reading or validating startup configuration.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("missing required value `{0}`")]
    Missing(&'static str),

    #[error("unsupported driver `{0}`; only SQLite drivers are available")]
    UnsupportedDriver(String),

    #[error("invalid schema generation mode `{0}`")]
    InvalidDdlAuto(String),

    #[error("invalid connection url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: SqlxError,
    },

    #[error("failed to load configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
}

/// Normalized classification of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConstraintViolation,
    ConnectivityFailure,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConstraintViolation => "constraint-violation",
            ErrorKind::ConnectivityFailure => "connectivity-failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A database error after translation by a
/// [`PersistenceExceptionResolver`](crate::db::PersistenceExceptionResolver).
#[derive(Debug, ThisError)]
#[error("Database error ({kind}): {source}")]
pub struct PersistenceError {
    kind: ErrorKind,
    #[source]
    source: SqlxError,
}

impl PersistenceError {
    pub fn new(kind: ErrorKind, source: SqlxError) -> Self {
        Self { kind, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn sqlx(&self) -> &SqlxError {
        &self.source
    }
}

impl InfraError {
    /// Translated kind when this is a database failure.
    pub fn persistence_kind(&self) -> Option<ErrorKind> {
        match self {
            InfraError::Persistence(e) => Some(e.kind()),
            _ => None,
        }
    }
}
