//! Transaction boundaries: the SQL transaction manager, the unit of work it
//! hands out, and the adapter exposing it to the event-sourcing runtime.

pub mod adapter;
pub mod transaction_manager;
pub mod unit_of_work;

pub use adapter::{SqlTransactionAdapter, TransactionBoundary};
pub use transaction_manager::TransactionManager;
pub use unit_of_work::UnitOfWork;
