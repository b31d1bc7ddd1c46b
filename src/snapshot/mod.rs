//! The snapshot engine: diff the remote against the snapshot being built,
//! record the result in a journal, apply it, then rotate old snapshots.

pub mod differ;
pub mod error;
pub mod journal;
pub mod layout;
pub mod materialize;
pub mod retention;
pub mod stats;
pub mod transfer;

pub use error::SnapshotError;
pub use layout::{SnapshotRoot, SnapshotState};
pub use stats::SessionStats;
