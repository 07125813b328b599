use crate::db::data_source::DataSource;
use crate::error::{ErrorKind, InfraError, PersistenceError};
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::debug;

/// Classifies raw database errors into [`ErrorKind`].
pub trait PersistenceExceptionResolver: Send + Sync + fmt::Debug {
    fn classify(&self, error: &SqlxError) -> ErrorKind;

    fn translate(&self, error: SqlxError) -> PersistenceError {
        let kind = self.classify(&error);
        PersistenceError::new(kind, error)
    }
}

/// Database vendor an error-code table belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vendor {
    Sqlite,
    H2,
    Postgres,
    MySql,
    Unknown(String),
}

impl Vendor {
    pub fn from_product_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("sqlite") {
            Vendor::Sqlite
        } else if lower == "h2" {
            Vendor::H2
        } else if lower.contains("postgres") {
            Vendor::Postgres
        } else if lower.contains("mysql") || lower.contains("mariadb") {
            Vendor::MySql
        } else {
            Vendor::Unknown(name.to_string())
        }
    }
}

/// Error-code based resolver; the vendor table is chosen from the product
/// name the data source reports.
#[derive(Debug, Clone)]
pub struct SqlErrorCodesResolver {
    vendor: Vendor,
}

impl SqlErrorCodesResolver {
    /// SQLite reports "SQLite" here, so other vendor tables are only reachable through [`Self::for_vendor`].
    pub async fn from_data_source(data_source: &DataSource) -> Result<Self, InfraError> {
        let metadata = data_source
            .metadata()
            .await
            .map_err(|e| Self::generic().translate(e))?;
        debug!(
            product = %metadata.product_name,
            version = %metadata.product_version,
            "error code table selected"
        );
        Ok(Self::for_vendor(Vendor::from_product_name(
            &metadata.product_name,
        )))
    }

    pub fn for_vendor(vendor: Vendor) -> Self {
        Self { vendor }
    }

    /// Resolver with no vendor table; only structural classification applies.
    pub fn generic() -> Self {
        Self::for_vendor(Vendor::Unknown(String::new()))
    }

    pub fn vendor(&self) -> &Vendor {
        &self.vendor
    }

    /// Looks up a vendor error code. Unrecognised codes are `Unknown`.
    pub fn classify_code(&self, code: &str) -> ErrorKind {
        match &self.vendor {
            Vendor::Sqlite => sqlite_code(code),
            Vendor::H2 => h2_code(code),
            Vendor::Postgres => sqlstate(code),
            Vendor::MySql => mysql_code(code),
            Vendor::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

impl PersistenceExceptionResolver for SqlErrorCodesResolver {
    fn classify(&self, error: &SqlxError) -> ErrorKind {
        match error {
            SqlxError::Database(db) => {
                let by_code = db
                    .code()
                    .map(|code| self.classify_code(&code))
                    .unwrap_or(ErrorKind::Unknown);
                match by_code {
                    ErrorKind::Unknown => match db.kind() {
                        sqlx::error::ErrorKind::UniqueViolation
                        | sqlx::error::ErrorKind::ForeignKeyViolation
                        | sqlx::error::ErrorKind::NotNullViolation
                        | sqlx::error::ErrorKind::CheckViolation => ErrorKind::ConstraintViolation,
                        _ => ErrorKind::Unknown,
                    },
                    kind => kind,
                }
            }
            SqlxError::PoolTimedOut => ErrorKind::Timeout,
            SqlxError::Io(_)
            | SqlxError::Tls(_)
            | SqlxError::PoolClosed
            | SqlxError::WorkerCrashed => ErrorKind::ConnectivityFailure,
            _ => ErrorKind::Unknown,
        }
    }
}

/// SQLite reports extended result codes; the low byte is the primary code.
fn sqlite_code(code: &str) -> ErrorKind {
    let Ok(extended) = code.trim().parse::<i32>() else {
        return ErrorKind::Unknown;
    };
    match extended & 0xff {
        // SQLITE_CONSTRAINT
        19 => ErrorKind::ConstraintViolation,
        // SQLITE_BUSY, SQLITE_LOCKED
        5 | 6 => ErrorKind::Timeout,
        // SQLITE_IOERR, SQLITE_CANTOPEN, SQLITE_NOTADB
        10 | 14 | 26 => ErrorKind::ConnectivityFailure,
        _ => ErrorKind::Unknown,
    }
}

fn h2_code(code: &str) -> ErrorKind {
    match code {
        "22001" | "22003" | "23502" | "23503" | "23505" | "23506" | "23513" | "23514" => {
            ErrorKind::ConstraintViolation
        }
        "50200" | "57014" => ErrorKind::Timeout,
        "90067" | "90098" | "90013" | "08000" => ErrorKind::ConnectivityFailure,
        _ => ErrorKind::Unknown,
    }
}

fn sqlstate(code: &str) -> ErrorKind {
    match code {
        "57014" | "55P03" | "40P01" => ErrorKind::Timeout,
        "57P01" | "57P02" | "57P03" => ErrorKind::ConnectivityFailure,
        c if c.starts_with("23") => ErrorKind::ConstraintViolation,
        c if c.starts_with("08") => ErrorKind::ConnectivityFailure,
        _ => ErrorKind::Unknown,
    }
}

fn mysql_code(code: &str) -> ErrorKind {
    match code {
        "1022" | "1048" | "1062" | "1169" | "1451" | "1452" | "1557" | "1586" | "3819" => {
            ErrorKind::ConstraintViolation
        }
        "1205" | "3024" => ErrorKind::Timeout,
        "2002" | "2003" | "2006" | "2013" | "1042" | "1043" => ErrorKind::ConnectivityFailure,
        _ => ErrorKind::Unknown,
    }
}
