use crate::config::{DdlAuto, JpaConfig};
use crate::db::data_source::DataSource;
use crate::db::exception_translator::PersistenceExceptionResolver;
use crate::db::schema::{Dialect, ManagedSchema, Table};
use crate::error::{ConfigError, InfraError};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Whether rows with large-object columns may be written outside a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobCreation {
    /// Large objects are created through the transaction's connection only.
    Contextual,
    NonContextual,
}

impl LobCreation {
    pub fn from_non_contextual_flag(non_contextual: bool) -> Self {
        if non_contextual {
            LobCreation::NonContextual
        } else {
            LobCreation::Contextual
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceProperties {
    pub ddl_auto: DdlAuto,
    pub dialect: Dialect,
    pub lob_creation: LobCreation,
}

impl PersistenceProperties {
    pub fn from_config(cfg: &JpaConfig) -> Result<Self, ConfigError> {
        if cfg.dialect.trim().is_empty() {
            return Err(ConfigError::Missing("jpa.dialect"));
        }
        let ddl_auto = cfg
            .command
            .ddl_auto
            .ok_or(ConfigError::Missing("jpa.command.ddl_auto"))?;
        let non_contextual = cfg
            .non_contextual_creation
            .ok_or(ConfigError::Missing("jpa.non_contextual_creation"))?;
        Ok(Self {
            ddl_auto,
            dialect: Dialect::parse(&cfg.dialect),
            lob_creation: LobCreation::from_non_contextual_flag(non_contextual),
        })
    }
}

/// Persistence-context factory: owns the managed tables and the vendor
/// properties every entity manager it creates works with.
#[derive(Debug)]
pub struct PersistenceUnit {
    name: String,
    data_source: Arc<DataSource>,
    schemas: Vec<&'static ManagedSchema>,
    properties: PersistenceProperties,
    open: AtomicBool,
}

impl PersistenceUnit {
    /// Builds the unit and applies the schema generation mode.
    pub async fn build(
        name: impl Into<String>,
        data_source: Arc<DataSource>,
        schemas: Vec<&'static ManagedSchema>,
        properties: PersistenceProperties,
    ) -> Result<Self, InfraError> {
        let unit = Self {
            name: name.into(),
            data_source,
            schemas,
            properties,
            open: AtomicBool::new(true),
        };
        unit.generate_schema().await?;
        info!(
            unit = %unit.name,
            ddl_auto = %unit.properties.ddl_auto,
            dialect = %unit.properties.dialect,
            schemas = ?unit.schemas.iter().map(|s| s.name).collect::<Vec<_>>(),
            "persistence unit ready"
        );
        Ok(unit)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_source(&self) -> &Arc<DataSource> {
        &self.data_source
    }

    pub fn properties(&self) -> &PersistenceProperties {
        &self.properties
    }

    pub fn schemas(&self) -> &[&'static ManagedSchema] {
        &self.schemas
    }

    pub fn tables(&self) -> impl Iterator<Item = &'static Table> + '_ {
        self.schemas.iter().flat_map(|s| s.tables.iter().copied())
    }

    pub fn manages(&self, table: &Table) -> bool {
        self.tables().any(|t| t.name == table.name)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Creates an entity manager bound to this unit.
    pub fn create_entity_manager(
        self: &Arc<Self>,
        resolver: Arc<dyn PersistenceExceptionResolver>,
    ) -> crate::db::EntityManager {
        crate::db::EntityManager::new(self.clone(), resolver)
    }

    /// Closes the unit; under `create-drop` the managed tables are dropped.
    pub async fn close(&self) -> Result<(), InfraError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if self.properties.ddl_auto == DdlAuto::CreateDrop && !self.data_source.is_closed() {
            let mut conn = self.connection().await?;
            for table in self.tables().collect::<Vec<_>>().into_iter().rev() {
                sqlx::query(&table.drop_sql())
                    .execute(&mut *conn)
                    .await
                    .map_err(schema_error)?;
            }
            info!(unit = %self.name, "managed tables dropped");
        }
        debug!(unit = %self.name, "persistence unit closed");
        Ok(())
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, InfraError> {
        self.data_source.acquire().await.map_err(schema_error)
    }

    async fn generate_schema(&self) -> Result<(), InfraError> {
        let dialect = &self.properties.dialect;
        let mut conn = self.connection().await?;
        match self.properties.ddl_auto {
            DdlAuto::None => {}
            DdlAuto::Validate => {
                for table in self.tables() {
                    validate_table(&mut conn, table).await?;
                }
            }
            DdlAuto::Update => {
                for table in self.tables() {
                    update_table(&mut conn, table, dialect).await?;
                }
            }
            DdlAuto::Create | DdlAuto::CreateDrop => {
                let tables: Vec<&Table> = self.tables().collect();
                for table in tables.iter().rev() {
                    sqlx::query(&table.drop_sql())
                        .execute(&mut *conn)
                        .await
                        .map_err(schema_error)?;
                }
                for table in tables {
                    sqlx::query(&table.create_sql(dialect, false))
                        .execute(&mut *conn)
                        .await
                        .map_err(schema_error)?;
                    debug!(table = table.name, "table created");
                }
            }
        }
        Ok(())
    }
}

async fn existing_columns(
    conn: &mut SqliteConnection,
    table: &Table,
) -> Result<HashSet<String>, InfraError> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?)")
        .bind(table.name)
        .fetch_all(conn)
        .await
        .map_err(schema_error)?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

async fn validate_table(conn: &mut SqliteConnection, table: &Table) -> Result<(), InfraError> {
    let existing = existing_columns(conn, table).await?;
    if existing.is_empty() {
        return Err(InfraError::SchemaValidation {
            table: table.name.to_string(),
            reason: "table is missing".to_string(),
        });
    }
    let missing: Vec<&str> = table
        .columns
        .iter()
        .map(|c| c.name)
        .filter(|name| !existing.contains(*name))
        .collect();
    if !missing.is_empty() {
        return Err(InfraError::SchemaValidation {
            table: table.name.to_string(),
            reason: format!("missing columns {missing:?}"),
        });
    }
    Ok(())
}

async fn update_table(
    conn: &mut SqliteConnection,
    table: &Table,
    dialect: &Dialect,
) -> Result<(), InfraError> {
    let existing = existing_columns(conn, table).await?;
    if existing.is_empty() {
        sqlx::query(&table.create_sql(dialect, true))
            .execute(&mut *conn)
            .await
            .map_err(schema_error)?;
        debug!(table = table.name, "table created");
        return Ok(());
    }
    for column in table.columns.iter().filter(|c| !existing.contains(c.name)) {
        if !column.nullable {
            return Err(InfraError::SchemaValidation {
                table: table.name.to_string(),
                reason: format!("cannot add NOT NULL column `{}` to existing table", column.name),
            });
        }
        sqlx::query(&table.add_column_sql(column, dialect))
            .execute(&mut *conn)
            .await
            .map_err(schema_error)?;
        warn!(table = table.name, column = column.name, "column added to existing table");
    }
    Ok(())
}

fn schema_error(e: sqlx::Error) -> InfraError {
    crate::db::exception_translator::SqlErrorCodesResolver::generic()
        .translate(e)
        .into()
}
