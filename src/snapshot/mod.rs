//! Aggregate snapshots, taken on a dedicated thread in their own transactions.

pub mod snapshotter;
pub mod trigger;

pub use snapshotter::{
    AggregateSnapshot, AggregateSnapshotBuilder, SnapshotEventEntry, SnapshotState, Snapshotter,
    SnapshotterFactory,
};
pub use trigger::{EventCountSnapshotTrigger, SnapshotTrigger};
