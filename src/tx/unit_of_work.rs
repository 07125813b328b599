use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIT_OF_WORK_ID: AtomicU64 = AtomicU64::new(1);

type AfterCommit = Box<dyn FnOnce() + Send>;

/// One open database transaction plus the callbacks to run once it commits.
///
/// Dropping a unit of work without committing rolls the transaction back.
pub struct UnitOfWork {
    id: u64,
    tx: Transaction<'static, Sqlite>,
    after_commit: Vec<AfterCommit>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("after_commit", &self.after_commit.len())
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self {
            id: NEXT_UNIT_OF_WORK_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            after_commit: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The transaction's connection. Repeated calls return the same connection.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Registers a callback that runs after a successful commit. Callbacks are
    /// discarded if the unit of work rolls back.
    pub fn after_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.after_commit.push(Box::new(callback));
    }

    pub(crate) async fn commit(self) -> Result<Vec<AfterCommit>, sqlx::Error> {
        let UnitOfWork {
            tx, after_commit, ..
        } = self;
        tx.commit().await?;
        Ok(after_commit)
    }

    pub(crate) async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}
