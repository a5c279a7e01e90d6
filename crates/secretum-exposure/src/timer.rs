//! Delayed task scheduling
//!
//! The exposure scheduler hands clear tasks to a [`DelayedTaskScheduler`]
//! instead of running timers itself. `TokioTimer` keeps them in-process;
//! `DetachedTimer` (see `detached.rs`) hands them to a separate process
//! that outlives the caller.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::detached::SlotFileLock;
use crate::slot::{SlotId, SlotRegistry};
use crate::task::{fire, ClearTask};
use crate::ExposureError;

/// A clear that has been handed to a scheduler and may still fire.
pub trait ScheduledClear: Send {
    /// Stop the clear from firing. A no-op if it already ran.
    fn cancel(&self);

    fn is_pending(&self) -> bool;
}

/// Durable-delayed-task collaborator.
pub trait DelayedTaskScheduler: Send + Sync {
    /// Arrange for `task` to run once after `delay`.
    ///
    /// Fails with `SchedulingUnavailable` when the underlying job system
    /// rejects the request.
    fn schedule(&self, task: ClearTask, delay: Duration) -> Result<Box<dyn ScheduledClear>, ExposureError>;

    /// Exclusive hold on `slot` against other processes, kept for the write
    /// and the `schedule` call of one expose. Schedulers whose clears never
    /// leave this process have nothing to lock.
    fn lock_slot(&self, _slot: &SlotId) -> Result<Option<SlotFileLock>, ExposureError> {
        Ok(None)
    }
}

/// In-process timer on the tokio runtime.
///
/// Pending clears die with the process; that only shortens enforcement of
/// the exposure window and is accepted.
pub struct TokioTimer {
    registry: Arc<SlotRegistry>,
    runtime: Option<Handle>,
}

impl TokioTimer {
    /// Captures the ambient runtime, if any, for use from threads that are
    /// not inside one.
    pub fn new(registry: Arc<SlotRegistry>) -> Self {
        Self {
            registry,
            runtime: Handle::try_current().ok(),
        }
    }
}

impl DelayedTaskScheduler for TokioTimer {
    fn schedule(&self, task: ClearTask, delay: Duration) -> Result<Box<dyn ScheduledClear>, ExposureError> {
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
            .ok_or_else(|| ExposureError::SchedulingUnavailable("no tokio runtime".to_string()))?;

        let registry = Arc::clone(&self.registry);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Slot lock and clipboard tools both block
            let slot = task.slot().clone();
            if let Err(e) = tokio::task::spawn_blocking(move || fire(&task, &registry)).await {
                warn!(slot = %slot, error = %e, "Scheduled clear did not run to completion");
            }
        });

        Ok(Box::new(TokioClear(handle)))
    }
}

struct TokioClear(JoinHandle<()>);

impl ScheduledClear for TokioClear {
    fn cancel(&self) {
        self.0.abort();
    }

    fn is_pending(&self) -> bool {
        !self.0.is_finished()
    }
}
