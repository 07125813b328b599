use crate::db::exception_translator::PersistenceExceptionResolver;
use crate::db::persistence_unit::{LobCreation, PersistenceUnit};
use crate::db::schema::Table;
use crate::error::InfraError;
use crate::tx::UnitOfWork;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Sqlite, SqliteConnection};
use std::sync::Arc;

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A row type mapped onto one managed [`Table`].
///
/// `bind_columns` must bind values in the order of
/// [`Table::insertable_columns`]; `bind_id` binds [`Table::key_columns`].
pub trait Entity: for<'r> FromRow<'r, SqliteRow> + Send + Sync + Unpin {
    type Id: Send + Sync;

    const TABLE: &'static Table;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;

    fn bind_id<'q>(id: &Self::Id, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

/// Shared persistence-context handle. Writes join the caller's unit of work;
/// `*_detached` operations run on their own pooled connection.
#[derive(Debug)]
pub struct EntityManager {
    unit: Arc<PersistenceUnit>,
    resolver: Arc<dyn PersistenceExceptionResolver>,
}

impl EntityManager {
    pub fn new(unit: Arc<PersistenceUnit>, resolver: Arc<dyn PersistenceExceptionResolver>) -> Self {
        Self { unit, resolver }
    }

    pub fn persistence_unit(&self) -> &Arc<PersistenceUnit> {
        &self.unit
    }

    pub fn resolver(&self) -> &Arc<dyn PersistenceExceptionResolver> {
        &self.resolver
    }

    /// Inserts a new row; a duplicate key surfaces as a constraint violation.
    pub async fn persist<E: Entity>(&self, uow: &mut UnitOfWork, entity: &E) -> Result<(), InfraError> {
        self.ensure_managed::<E>()?;
        self.insert(uow.connection(), entity, false).await
    }

    /// Inserts or replaces the row with the entity's key.
    pub async fn merge<E: Entity>(&self, uow: &mut UnitOfWork, entity: &E) -> Result<(), InfraError> {
        self.ensure_managed::<E>()?;
        self.insert(uow.connection(), entity, true).await
    }

    /// Inserts outside any unit of work, in autocommit mode. Rejected for
    /// tables with large-object columns unless large objects are non-contextual.
    pub async fn persist_detached<E: Entity>(&self, entity: &E) -> Result<(), InfraError> {
        self.ensure_managed::<E>()?;
        if E::TABLE.has_lob() && self.unit.properties().lob_creation == LobCreation::Contextual {
            return Err(InfraError::LobOutsideUnitOfWork(E::TABLE.name));
        }
        let mut conn = self
            .unit
            .data_source()
            .acquire()
            .await
            .map_err(|e| self.resolver.translate(e))?;
        self.insert(&mut conn, entity, false).await
    }

    pub async fn find<E: Entity>(
        &self,
        uow: &mut UnitOfWork,
        id: &E::Id,
    ) -> Result<Option<E>, InfraError> {
        self.ensure_managed::<E>()?;
        self.select(uow.connection(), id).await
    }

    /// Reads committed state through a fresh connection.
    pub async fn find_detached<E: Entity>(&self, id: &E::Id) -> Result<Option<E>, InfraError> {
        self.ensure_managed::<E>()?;
        let mut conn = self
            .unit
            .data_source()
            .acquire()
            .await
            .map_err(|e| self.resolver.translate(e))?;
        self.select(&mut conn, id).await
    }

    /// Deletes by key; returns whether a row was removed.
    pub async fn remove<E: Entity>(&self, uow: &mut UnitOfWork, id: &E::Id) -> Result<bool, InfraError> {
        self.ensure_managed::<E>()?;
        let sql = format!("DELETE FROM {} WHERE {}", E::TABLE.name, key_predicate(E::TABLE));
        let done = E::bind_id(id, sqlx::query(&sql))
            .execute(uow.connection())
            .await
            .map_err(|e| self.resolver.translate(e))?;
        Ok(done.rows_affected() > 0)
    }

    fn ensure_managed<E: Entity>(&self) -> Result<(), InfraError> {
        if self.unit.manages(E::TABLE) {
            Ok(())
        } else {
            Err(InfraError::UnmanagedEntity(E::TABLE.name))
        }
    }

    async fn insert<E: Entity>(
        &self,
        conn: &mut SqliteConnection,
        entity: &E,
        upsert: bool,
    ) -> Result<(), InfraError> {
        let sql = insert_sql(E::TABLE, upsert);
        entity
            .bind_columns(sqlx::query(&sql))
            .execute(conn)
            .await
            .map_err(|e| self.resolver.translate(e))?;
        Ok(())
    }

    async fn select<E: Entity>(
        &self,
        conn: &mut SqliteConnection,
        id: &E::Id,
    ) -> Result<Option<E>, InfraError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            column_list(E::TABLE),
            E::TABLE.name,
            key_predicate(E::TABLE)
        );
        let row = E::bind_id(id, sqlx::query(&sql))
            .fetch_optional(conn)
            .await
            .map_err(|e| self.resolver.translate(e))?;
        row.map(|row| E::from_row(&row))
            .transpose()
            .map_err(|e| self.resolver.translate(e).into())
    }
}

/// Hands out the single shared [`EntityManager`].
#[derive(Debug)]
pub struct EntityManagerProvider {
    entity_manager: Arc<EntityManager>,
}

impl EntityManagerProvider {
    pub fn new(entity_manager: Arc<EntityManager>) -> Self {
        Self { entity_manager }
    }

    pub fn entity_manager(&self) -> &Arc<EntityManager> {
        &self.entity_manager
    }
}

fn column_list(table: &Table) -> String {
    table.columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
}

fn key_predicate(table: &Table) -> String {
    table
        .key_columns()
        .iter()
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn insert_sql(table: &Table, upsert: bool) -> String {
    let columns: Vec<&str> = table.insertable_columns().map(|c| c.name).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name,
        columns.join(", "),
        placeholders
    );
    if upsert {
        let keys = table.key_columns();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !keys.contains(*c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        sql.push_str(&format!(" ON CONFLICT ({}) DO ", keys.join(", ")));
        if updates.is_empty() {
            sql.push_str("NOTHING");
        } else {
            sql.push_str(&format!("UPDATE SET {}", updates.join(", ")));
        }
    }
    sql
}
