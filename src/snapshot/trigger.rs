use crate::error::InfraError;
use crate::snapshot::Snapshotter;
use crate::tx::UnitOfWork;
use std::sync::Arc;
use tracing::warn;

/// Requests a snapshot every `threshold` events applied to an aggregate.
#[derive(Debug, Clone)]
pub struct EventCountSnapshotTrigger {
    snapshotter: Arc<Snapshotter>,
    threshold: u32,
}

impl EventCountSnapshotTrigger {
    /// A threshold of zero behaves like one.
    pub fn new(snapshotter: Arc<Snapshotter>, threshold: u32) -> Self {
        Self {
            snapshotter,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn prepare_trigger(
        &self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> SnapshotTrigger {
        SnapshotTrigger {
            snapshotter: self.snapshotter.clone(),
            threshold: self.threshold,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            counter: 0,
        }
    }
}

/// Per-aggregate event counter.
#[derive(Debug)]
pub struct SnapshotTrigger {
    snapshotter: Arc<Snapshotter>,
    threshold: u32,
    aggregate_type: String,
    aggregate_id: String,
    counter: u32,
}

impl SnapshotTrigger {
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Counts one event. Once the threshold is reached the snapshot is
    /// scheduled after `uow` commits, or right away without a unit of work.
    pub fn event_handled(&mut self, uow: Option<&mut UnitOfWork>) -> Result<(), InfraError> {
        self.counter += 1;
        if self.counter < self.threshold {
            return Ok(());
        }
        self.counter = 0;

        match uow {
            Some(uow) => {
                let snapshotter = self.snapshotter.clone();
                let aggregate_type = self.aggregate_type.clone();
                let aggregate_id = self.aggregate_id.clone();
                uow.after_commit(move || {
                    if let Err(e) = snapshotter.schedule_snapshot(&aggregate_type, &aggregate_id) {
                        warn!(%aggregate_type, %aggregate_id, error = %e, "failed to schedule snapshot");
                    }
                });
            }
            None => {
                self.snapshotter
                    .schedule_snapshot(&self.aggregate_type, &self.aggregate_id)?;
            }
        }
        Ok(())
    }
}
