use crate::error::InfraError;
use crate::tx::{TransactionManager, UnitOfWork};
use async_trait::async_trait;
use std::sync::Arc;

/// Transaction capability the event-sourcing runtime programs against.
#[async_trait]
pub trait TransactionBoundary: Send + Sync {
    async fn start_transaction(&self) -> Result<UnitOfWork, InfraError>;

    async fn commit(&self, uow: UnitOfWork) -> Result<(), InfraError>;

    async fn rollback(&self, uow: UnitOfWork) -> Result<(), InfraError>;
}

/// Exposes a [`TransactionManager`] as a [`TransactionBoundary`].
#[derive(Debug, Clone)]
pub struct SqlTransactionAdapter {
    transaction_manager: Arc<TransactionManager>,
}

impl SqlTransactionAdapter {
    pub fn new(transaction_manager: Arc<TransactionManager>) -> Self {
        Self {
            transaction_manager,
        }
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }
}

#[async_trait]
impl TransactionBoundary for SqlTransactionAdapter {
    async fn start_transaction(&self) -> Result<UnitOfWork, InfraError> {
        self.transaction_manager.begin().await
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<(), InfraError> {
        self.transaction_manager.commit(uow).await
    }

    async fn rollback(&self, uow: UnitOfWork) -> Result<(), InfraError> {
        self.transaction_manager.rollback(uow).await
    }
}
