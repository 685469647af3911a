//! Check run synchronization for BeeCI.
//!
//! The [`ChangeListener`] follows the store's change feed and hands every
//! changed build to the [`Synchronizer`], which mirrors it onto a GitHub
//! check run. A failed reconciliation is not retried; the next change to the
//! same build reconciles it again.

pub mod error;
pub mod listener;
pub mod synchronizer;

pub use error::{SyncError, SyncResult};
pub use listener::{ChangeHandler, ChangeListener, ListenerState};
pub use synchronizer::{Reconciled, Synchronizer};
