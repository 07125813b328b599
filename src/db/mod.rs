//! Database module: data source, managed schemas and the persistence context.
//!
//! Layout:
//! - `data_source.rs`: SQLite pool built from the `jpa` configuration
//! - `schema.rs`: table metadata and DDL generation (SQLite-first)
//! - `persistence_unit.rs`: schema generation modes and vendor properties
//! - `exception_translator.rs`: vendor error codes to [`ErrorKind`](crate::error::ErrorKind)
//! - `entity_manager.rs`: entity mapping and the shared entity manager
//! - `connection.rs`: unit-of-work aware connection provider

pub mod connection;
pub mod data_source;
pub mod entity_manager;
pub mod exception_translator;
pub mod persistence_unit;
pub mod schema;

pub use connection::{
    ConnectionProvider, DataSourceConnectionProvider, ManagedConnection,
    UnitOfWorkAwareConnectionProvider,
};
pub use data_source::{DataSource, DatabaseMetadata, Driver, SqlitePool};
pub use entity_manager::{Entity, EntityManager, EntityManagerProvider, SqliteQuery};
pub use exception_translator::{PersistenceExceptionResolver, SqlErrorCodesResolver, Vendor};
pub use persistence_unit::{LobCreation, PersistenceProperties, PersistenceUnit};
pub use schema::{Column, ColumnType, Dialect, ManagedSchema, Table};
