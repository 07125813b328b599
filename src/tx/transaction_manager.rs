use crate::db::{DataSource, PersistenceExceptionResolver, PersistenceUnit};
use crate::error::InfraError;
use crate::tx::UnitOfWork;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Commit/rollback boundaries over one persistence unit and its data source.
pub struct TransactionManager {
    persistence_unit: Arc<PersistenceUnit>,
    data_source: Arc<DataSource>,
    resolver: Arc<dyn PersistenceExceptionResolver>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("persistence_unit", &self.persistence_unit.name())
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// Fails unless `persistence_unit` was built on this very `data_source`.
    pub fn new(
        persistence_unit: Arc<PersistenceUnit>,
        data_source: Arc<DataSource>,
        resolver: Arc<dyn PersistenceExceptionResolver>,
    ) -> Result<Self, InfraError> {
        if !Arc::ptr_eq(persistence_unit.data_source(), &data_source) {
            return Err(InfraError::DataSourceMismatch("transaction manager"));
        }
        Ok(Self {
            persistence_unit,
            data_source,
            resolver,
        })
    }

    pub fn persistence_unit(&self) -> &Arc<PersistenceUnit> {
        &self.persistence_unit
    }

    pub fn data_source(&self) -> &Arc<DataSource> {
        &self.data_source
    }

    pub async fn begin(&self) -> Result<UnitOfWork, InfraError> {
        let tx = self
            .data_source
            .pool()
            .begin()
            .await
            .map_err(|e| self.resolver.translate(e))?;
        let uow = UnitOfWork::new(tx);
        debug!(uow = uow.id(), "unit of work started");
        Ok(uow)
    }

    /// Commits, then runs the unit of work's after-commit callbacks.
    pub async fn commit(&self, uow: UnitOfWork) -> Result<(), InfraError> {
        let id = uow.id();
        let callbacks = uow.commit().await.map_err(|e| {
            warn!(uow = id, error = %e, "commit failed");
            self.resolver.translate(e)
        })?;
        debug!(uow = id, callbacks = callbacks.len(), "unit of work committed");
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    pub async fn rollback(&self, uow: UnitOfWork) -> Result<(), InfraError> {
        let id = uow.id();
        uow.rollback()
            .await
            .map_err(|e| self.resolver.translate(e))?;
        debug!(uow = id, "unit of work rolled back");
        Ok(())
    }

    /// Runs `work` in a new unit of work: commits on `Ok`, rolls back on `Err`
    /// and hands the error back unchanged.
    ///
    /// ```ignore
    /// let store = tokens.clone();
    /// tm.execute(move |uow| Box::pin(async move {
    ///     store.release_claim(uow, "orders", 0).await
    /// }))
    /// .await?;
    /// ```
    pub async fn execute<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut UnitOfWork) -> BoxFuture<'c, Result<T, E>>,
        E: From<InfraError>,
    {
        let mut uow = self.begin().await?;
        match work(&mut uow).await {
            Ok(value) => {
                self.commit(uow).await?;
                Ok(value)
            }
            Err(err) => {
                let id = uow.id();
                if let Err(rollback_err) = self.rollback(uow).await {
                    warn!(uow = id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
