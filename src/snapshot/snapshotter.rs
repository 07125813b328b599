use crate::config::SnapshotterConfig;
use crate::db::schema::SNAPSHOT_EVENT_ENTRY;
use crate::db::{Entity, EntityManagerProvider, SqliteQuery, Table};
use crate::error::InfraError;
use crate::serialization::{Serializer, short_type_name};
use crate::tx::{TransactionManager, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// State captured for one aggregate at a given sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotState {
    pub sequence_number: i64,
    pub payload_type: String,
    pub payload: Value,
}

impl SnapshotState {
    pub fn new<T: Serialize>(sequence_number: i64, state: &T) -> Result<Self, InfraError> {
        Ok(Self {
            sequence_number,
            payload_type: short_type_name::<T>().to_string(),
            payload: serde_json::to_value(state)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub state: SnapshotState,
    pub timestamp: DateTime<Utc>,
}

/// Produces the snapshot of one aggregate type. Runs inside the snapshot's
/// own unit of work on the snapshotter thread.
#[async_trait]
pub trait AggregateSnapshotBuilder: Send + Sync {
    fn aggregate_type(&self) -> &str;

    /// `None` when there is nothing to snapshot.
    async fn build_snapshot(
        &self,
        uow: &mut UnitOfWork,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotState>, InfraError>;
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SnapshotEventEntry {
    pub aggregate_identifier: String,
    pub sequence_number: i64,
    #[sqlx(rename = "type")]
    pub aggregate_type: String,
    pub event_identifier: String,
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub time_stamp: DateTime<Utc>,
}

impl Entity for SnapshotEventEntry {
    type Id = (String, i64, String);

    const TABLE: &'static Table = &SNAPSHOT_EVENT_ENTRY;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.aggregate_identifier.clone())
            .bind(self.sequence_number)
            .bind(self.aggregate_type.clone())
            .bind(self.event_identifier.clone())
            .bind(self.payload_type.clone())
            .bind(self.payload.clone())
            .bind(self.time_stamp)
    }

    fn bind_id<'q>(id: &Self::Id, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(id.0.clone()).bind(id.1).bind(id.2.clone())
    }
}

enum SnapshotCommand {
    Snapshot {
        aggregate_type: String,
        aggregate_id: String,
    },
    Flush(oneshot::Sender<()>),
}

type PendingSet = Arc<Mutex<HashSet<(String, String)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configures the dedicated snapshot executor and binds it to the
/// transaction manager. Produces at most one [`Snapshotter`].
pub struct SnapshotterFactory {
    transaction_manager: Arc<TransactionManager>,
    entity_manager_provider: Arc<EntityManagerProvider>,
    serializer: Arc<dyn Serializer>,
    config: SnapshotterConfig,
    created: Mutex<Option<Arc<Snapshotter>>>,
}

impl std::fmt::Debug for SnapshotterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotterFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SnapshotterFactory {
    pub fn new(
        transaction_manager: Arc<TransactionManager>,
        entity_manager_provider: Arc<EntityManagerProvider>,
        serializer: Arc<dyn Serializer>,
        config: SnapshotterConfig,
    ) -> Self {
        Self {
            transaction_manager,
            entity_manager_provider,
            serializer,
            config,
            created: Mutex::new(None),
        }
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }

    pub fn config(&self) -> &SnapshotterConfig {
        &self.config
    }

    /// The snapshotter, if [`create`](Self::create) has run.
    pub fn snapshotter(&self) -> Option<Arc<Snapshotter>> {
        lock(&self.created).clone()
    }

    /// Starts the snapshot thread. A second call fails: the executor is never
    /// duplicated or shared.
    pub fn create(
        &self,
        builders: Vec<Arc<dyn AggregateSnapshotBuilder>>,
    ) -> Result<Arc<Snapshotter>, InfraError> {
        let mut created = lock(&self.created);
        if created.is_some() {
            return Err(InfraError::SnapshotterAlreadyCreated);
        }

        let builders: HashMap<String, Arc<dyn AggregateSnapshotBuilder>> = builders
            .into_iter()
            .map(|b| (b.aggregate_type().to_string(), b))
            .collect();
        let builders = Arc::new(builders);
        let pending: PendingSet = Arc::new(Mutex::new(HashSet::new()));
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));

        let worker = SnapshotWorker {
            transaction_manager: self.transaction_manager.clone(),
            entity_manager_provider: self.entity_manager_provider.clone(),
            serializer: self.serializer.clone(),
            builders: builders.clone(),
            pending: pending.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "snapshotter runtime failed to start");
                        return;
                    }
                };
                runtime.block_on(worker.run(receiver));
            })?;

        info!(
            thread = %self.config.thread_name,
            aggregate_types = ?builders.keys().collect::<Vec<_>>(),
            "snapshotter started"
        );

        let snapshotter = Arc::new(Snapshotter {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            builders,
            pending,
            entity_manager_provider: self.entity_manager_provider.clone(),
            serializer: self.serializer.clone(),
        });
        *created = Some(snapshotter.clone());
        Ok(snapshotter)
    }

    /// Drains and stops the snapshotter, if one was created.
    pub async fn shutdown(&self) {
        let snapshotter = lock(&self.created).clone();
        if let Some(snapshotter) = snapshotter {
            snapshotter.shutdown().await;
        }
    }
}

/// Queues snapshot requests for the dedicated snapshot thread. Requests for
/// an aggregate that is already pending are coalesced.
pub struct Snapshotter {
    sender: Mutex<Option<mpsc::Sender<SnapshotCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    builders: Arc<HashMap<String, Arc<dyn AggregateSnapshotBuilder>>>,
    pending: PendingSet,
    entity_manager_provider: Arc<EntityManagerProvider>,
    serializer: Arc<dyn Serializer>,
}

impl std::fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshotter")
            .field("aggregate_types", &self.builders.keys().collect::<Vec<_>>())
            .field("pending", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

impl Snapshotter {
    /// Returns `Ok(false)` when the request was coalesced with a pending one
    /// or dropped because the queue is full.
    pub fn schedule_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<bool, InfraError> {
        if !self.builders.contains_key(aggregate_type) {
            return Err(InfraError::UnknownAggregateType(aggregate_type.to_string()));
        }
        let sender = lock(&self.sender)
            .clone()
            .ok_or(InfraError::SnapshotterStopped)?;

        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        if !lock(&self.pending).insert(key.clone()) {
            debug!(aggregate_type, aggregate_id, "snapshot already pending");
            return Ok(false);
        }

        let command = SnapshotCommand::Snapshot {
            aggregate_type: key.0.clone(),
            aggregate_id: key.1.clone(),
        };
        match sender.try_send(command) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                lock(&self.pending).remove(&key);
                warn!(aggregate_type, aggregate_id, "snapshot queue full; request dropped");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                lock(&self.pending).remove(&key);
                Err(InfraError::SnapshotterStopped)
            }
        }
    }

    pub fn is_pending(&self, aggregate_type: &str, aggregate_id: &str) -> bool {
        lock(&self.pending).contains(&(aggregate_type.to_string(), aggregate_id.to_string()))
    }

    /// Waits until every request scheduled before this call has been handled.
    pub async fn flush(&self) -> Result<(), InfraError> {
        let sender = lock(&self.sender)
            .clone()
            .ok_or(InfraError::SnapshotterStopped)?;
        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(SnapshotCommand::Flush(done_tx))
            .await
            .map_err(|_| InfraError::SnapshotterStopped)?;
        done_rx.await.map_err(|_| InfraError::SnapshotterStopped)
    }

    /// Newest stored snapshot of an aggregate.
    pub async fn latest_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateSnapshot>, InfraError> {
        let em = self.entity_manager_provider.entity_manager();
        let entry: Option<SnapshotEventEntry> = sqlx::query_as(
            "SELECT aggregate_identifier, sequence_number, type, event_identifier, payload_type, payload, time_stamp \
             FROM snapshot_event_entry WHERE aggregate_identifier = ? AND type = ? \
             ORDER BY sequence_number DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .bind(aggregate_type)
        .fetch_optional(em.persistence_unit().data_source().pool())
        .await
        .map_err(|e| em.resolver().translate(e))?;

        entry
            .map(|entry| {
                let payload = self.serializer.deserialize(&entry.payload)?;
                Ok(AggregateSnapshot {
                    aggregate_type: entry.aggregate_type,
                    aggregate_id: entry.aggregate_identifier,
                    state: SnapshotState {
                        sequence_number: entry.sequence_number,
                        payload_type: entry.payload_type,
                        payload,
                    },
                    timestamp: entry.time_stamp,
                })
            })
            .transpose()
    }

    /// Stops accepting requests, lets the queue drain and joins the thread.
    pub async fn shutdown(&self) {
        lock(&self.sender).take();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => info!("snapshotter stopped"),
                Ok(Err(_)) => error!("snapshotter thread panicked"),
                Err(e) => error!(error = %e, "failed to join snapshotter thread"),
            }
        }
    }
}

struct SnapshotWorker {
    transaction_manager: Arc<TransactionManager>,
    entity_manager_provider: Arc<EntityManagerProvider>,
    serializer: Arc<dyn Serializer>,
    builders: Arc<HashMap<String, Arc<dyn AggregateSnapshotBuilder>>>,
    pending: PendingSet,
}

impl SnapshotWorker {
    async fn run(self, mut receiver: mpsc::Receiver<SnapshotCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                SnapshotCommand::Snapshot {
                    aggregate_type,
                    aggregate_id,
                } => {
                    match self.create_snapshot(&aggregate_type, &aggregate_id).await {
                        Ok(true) => debug!(%aggregate_type, %aggregate_id, "snapshot stored"),
                        Ok(false) => debug!(%aggregate_type, %aggregate_id, "nothing to snapshot"),
                        Err(e) => warn!(
                            %aggregate_type,
                            %aggregate_id,
                            error = %e,
                            "snapshot failed"
                        ),
                    }
                    lock(&self.pending).remove(&(aggregate_type, aggregate_id));
                }
                SnapshotCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("snapshot queue closed");
    }

    async fn create_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<bool, InfraError> {
        let builder = self
            .builders
            .get(aggregate_type)
            .cloned()
            .ok_or_else(|| InfraError::UnknownAggregateType(aggregate_type.to_string()))?;
        let em = self.entity_manager_provider.entity_manager().clone();
        let serializer = self.serializer.clone();
        let aggregate_type = aggregate_type.to_string();
        let aggregate_id = aggregate_id.to_string();

        self.transaction_manager
            .execute(move |uow| {
                Box::pin(async move {
                    let Some(state) = builder.build_snapshot(uow, &aggregate_id).await? else {
                        return Ok(false);
                    };
                    let entry = SnapshotEventEntry {
                        event_identifier: format!(
                            "{aggregate_type}:{aggregate_id}:{}",
                            state.sequence_number
                        ),
                        aggregate_identifier: aggregate_id.clone(),
                        sequence_number: state.sequence_number,
                        aggregate_type: aggregate_type.clone(),
                        payload_type: state.payload_type,
                        payload: serializer.serialize(&state.payload)?,
                        time_stamp: Utc::now(),
                    };
                    em.merge(uow, &entry).await?;
                    sqlx::query(
                        "DELETE FROM snapshot_event_entry \
                         WHERE aggregate_identifier = ? AND type = ? AND sequence_number < ?",
                    )
                    .bind(&aggregate_id)
                    .bind(&aggregate_type)
                    .bind(entry.sequence_number)
                    .execute(uow.connection())
                    .await
                    .map_err(|e| em.resolver().translate(e))?;
                    Ok(true)
                })
            })
            .await
    }
}
