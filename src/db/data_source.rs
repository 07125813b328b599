use crate::config::JpaConfig;
use crate::error::{ConfigError, ErrorKind, InfraError, PersistenceError};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

pub type SqlitePool = Pool<Sqlite>;

/// Database drivers this crate can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Sqlite,
}

impl FromStr for Driver {
    type Err = ConfigError;

    /// Accepts `sqlite` as well as JDBC-style class names such as `org.sqlite.JDBC`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name.is_empty() {
            return Err(ConfigError::Missing("jpa.driver_class_name"));
        }
        if name.to_ascii_lowercase().contains("sqlite") {
            Ok(Driver::Sqlite)
        } else {
            Err(ConfigError::UnsupportedDriver(name.to_string()))
        }
    }
}

/// Product information reported by the connected database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMetadata {
    pub product_name: String,
    pub product_version: String,
}

/// Shareable connection factory over a SQLite pool.
pub struct DataSource {
    pool: SqlitePool,
    driver: Driver,
    url: String,
    username: String,
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl DataSource {
    /// Validates the connection settings, then opens the pool eagerly so an
    /// unreachable database fails here rather than on first use.
    pub async fn connect(cfg: &JpaConfig) -> Result<Self, InfraError> {
        let driver = validate(cfg)?;
        let url = cfg.command.url.trim().to_string();

        let mut connect_opts = SqliteConnectOptions::from_str(&url)
            .map_err(|source| ConfigError::InvalidUrl {
                url: url.clone(),
                source,
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        if !cfg.show_sql {
            connect_opts = connect_opts.disable_statement_logging();
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.pool.max_connections.max(1))
            .acquire_timeout(cfg.pool.acquire_timeout())
            .connect_with(connect_opts)
            .await
            .map_err(|e| PersistenceError::new(ErrorKind::ConnectivityFailure, e))?;

        info!(
            url = %url,
            username = %cfg.command.username,
            max_connections = cfg.pool.max_connections.max(1),
            "data source connected"
        );

        Ok(Self {
            pool,
            driver,
            url,
            username: cfg.command.username.clone(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Checks a raw connection out of the pool.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    pub async fn metadata(&self) -> Result<DatabaseMetadata, sqlx::Error> {
        let (version,): (String,) = sqlx::query_as("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(DatabaseMetadata {
            product_name: "SQLite".to_string(),
            product_version: version,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            debug!(url = %self.url, "data source closed");
        }
    }
}

/// Required values must be non-empty; the password may be blank.
fn validate(cfg: &JpaConfig) -> Result<Driver, ConfigError> {
    let driver: Driver = cfg.driver_class_name.parse()?;
    if cfg.command.url.trim().is_empty() {
        return Err(ConfigError::Missing("jpa.command.url"));
    }
    if cfg.command.username.trim().is_empty() {
        return Err(ConfigError::Missing("jpa.command.username"));
    }
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpa(driver: &str, url: &str) -> JpaConfig {
        let mut cfg = JpaConfig::default();
        cfg.driver_class_name = driver.to_string();
        cfg.dialect = "H2".to_string();
        cfg.command.url = url.to_string();
        cfg.command.username = "sa".to_string();
        cfg
    }

    #[test]
    fn driver_names() {
        assert_eq!("sqlite".parse::<Driver>().unwrap(), Driver::Sqlite);
        assert_eq!("org.sqlite.JDBC".parse::<Driver>().unwrap(), Driver::Sqlite);
        assert!(matches!(
            "org.h2.Driver".parse::<Driver>(),
            Err(ConfigError::UnsupportedDriver(_))
        ));
        assert!(matches!("  ".parse::<Driver>(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn validation_rejects_blank_values() {
        assert!(matches!(
            validate(&jpa("", "sqlite::memory:")),
            Err(ConfigError::Missing("jpa.driver_class_name"))
        ));
        assert!(matches!(
            validate(&jpa("sqlite", " ")),
            Err(ConfigError::Missing("jpa.command.url"))
        ));
        let mut no_user = jpa("sqlite", "sqlite::memory:");
        no_user.command.username.clear();
        assert!(matches!(
            validate(&no_user),
            Err(ConfigError::Missing("jpa.command.username"))
        ));
        assert!(validate(&jpa("sqlite", "sqlite::memory:")).is_ok());
    }

    #[tokio::test]
    async fn connects_and_reports_metadata() {
        let ds = DataSource::connect(&jpa("sqlite", "sqlite::memory:"))
            .await
            .expect("in-memory data source");
        let meta = ds.metadata().await.expect("metadata");
        assert_eq!(meta.product_name, "SQLite");
        assert!(!meta.product_version.is_empty());
        ds.close().await;
        assert!(ds.is_closed());
    }
}
