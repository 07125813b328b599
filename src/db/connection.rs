use crate::db::data_source::DataSource;
use crate::db::exception_translator::PersistenceExceptionResolver;
use crate::error::InfraError;
use crate::tx::UnitOfWork;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Source of raw pooled connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connection(&self) -> Result<PoolConnection<Sqlite>, InfraError>;
}

/// Checks connections out of a [`DataSource`].
#[derive(Debug)]
pub struct DataSourceConnectionProvider {
    data_source: Arc<DataSource>,
    resolver: Arc<dyn PersistenceExceptionResolver>,
}

impl DataSourceConnectionProvider {
    pub fn new(data_source: Arc<DataSource>, resolver: Arc<dyn PersistenceExceptionResolver>) -> Self {
        Self {
            data_source,
            resolver,
        }
    }

    pub fn data_source(&self) -> &Arc<DataSource> {
        &self.data_source
    }
}

#[async_trait]
impl ConnectionProvider for DataSourceConnectionProvider {
    async fn connection(&self) -> Result<PoolConnection<Sqlite>, InfraError> {
        self.data_source
            .acquire()
            .await
            .map_err(|e| self.resolver.translate(e).into())
    }
}

/// A connection lent by [`UnitOfWorkAwareConnectionProvider`].
pub enum ManagedConnection<'u> {
    /// The unit of work's own connection; stays open until it commits or rolls back.
    Bound(&'u mut SqliteConnection),
    /// A pooled connection, returned to the pool on drop.
    Detached(PoolConnection<Sqlite>),
}

impl ManagedConnection<'_> {
    pub fn is_bound(&self) -> bool {
        matches!(self, ManagedConnection::Bound(_))
    }
}

impl Deref for ManagedConnection<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match self {
            ManagedConnection::Bound(conn) => &**conn,
            ManagedConnection::Detached(conn) => &**conn,
        }
    }
}

impl DerefMut for ManagedConnection<'_> {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            ManagedConnection::Bound(conn) => &mut **conn,
            ManagedConnection::Detached(conn) => &mut **conn,
        }
    }
}

/// Binds connection lifetime to the active unit of work: every request made
/// with a unit of work gets that unit's connection, requests without one get
/// a fresh connection from the delegate.
pub struct UnitOfWorkAwareConnectionProvider {
    delegate: Arc<dyn ConnectionProvider>,
}

impl UnitOfWorkAwareConnectionProvider {
    pub fn new(delegate: Arc<dyn ConnectionProvider>) -> Self {
        Self { delegate }
    }

    pub fn delegate(&self) -> &Arc<dyn ConnectionProvider> {
        &self.delegate
    }

    pub async fn connection<'u>(
        &self,
        uow: Option<&'u mut UnitOfWork>,
    ) -> Result<ManagedConnection<'u>, InfraError> {
        match uow {
            Some(uow) => Ok(ManagedConnection::Bound(uow.connection())),
            None => Ok(ManagedConnection::Detached(self.delegate.connection().await?)),
        }
    }
}
