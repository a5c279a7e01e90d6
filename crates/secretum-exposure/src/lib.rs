//! Secretum Exposure - bounded-time exposure of sensitive values
//!
//! Copying a password to the clipboard hands it to every other program on
//! the desktop. This crate makes that exposure time-bounded: each exposed
//! value gets one armed clear per slot, which only fires if the resource
//! still holds that exact value.

pub mod clipboard;
pub mod detached;
pub mod scheduler;
pub mod slot;
pub mod task;
pub mod timer;

pub use clipboard::{ClipboardTool, SystemClipboard};
pub use detached::{DetachedJob, DetachedTimer, SlotFileLock};
pub use scheduler::{ExposeOutcome, ExposureScheduler, DEFAULT_WINDOW};
pub use slot::{LockedSlot, MemoryResource, ResourceError, SharedResource, SlotId, SlotRegistry};
pub use task::{ClearOutcome, ClearTask};
pub use timer::{DelayedTaskScheduler, ScheduledClear, TokioTimer};

/// Errors from exposing values and arming their clears
#[derive(Debug, thiserror::Error)]
pub enum ExposureError {
    #[error("Unknown exposure slot: {0}")]
    UnknownSlot(SlotId),

    #[error("Shared resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Auto-clear scheduling unavailable: {0}")]
    SchedulingUnavailable(String),

    #[error("Invalid clear job: {0}")]
    InvalidJob(String),
}
