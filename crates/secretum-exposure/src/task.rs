//! The clear task
//!
//! A task carries everything it needs (slot id and the exact value that was
//! exposed) so it can run in a different execution context from the one
//! that scheduled it, including another process.

use std::fmt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::slot::{LockedSlot, ResourceError, SharedResource, SlotId, SlotRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The resource still held our value and was cleared
    Cleared,
    /// Something else was put in the resource; left untouched
    Replaced,
    /// The resource was already empty
    AlreadyEmpty,
    /// A newer exposure took over the slot before this task fired
    Superseded,
}

#[derive(Clone)]
pub struct ClearTask {
    slot: SlotId,
    expected: Zeroizing<String>,
    generation: Option<u64>,
}

impl ClearTask {
    pub fn new(slot: SlotId, expected: &str) -> Self {
        Self {
            slot,
            expected: Zeroizing::new(expected.to_string()),
            generation: None,
        }
    }

    /// Bind the task to one exposure of its slot. It is skipped as
    /// superseded once the slot has moved past `generation`, even when the
    /// same value was exposed again. Only meaningful inside the process
    /// that owns the slot registry.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn slot(&self) -> &SlotId {
        &self.slot
    }

    pub(crate) fn expected(&self) -> &str {
        &self.expected
    }

    /// Clear the resource if and only if it still holds the value this
    /// task was created for. The contents are read now, at fire time.
    pub fn execute(&self, resource: &dyn SharedResource) -> Result<ClearOutcome, ResourceError> {
        match resource.read_current()? {
            Some(current) if current.as_slice() == self.expected.as_bytes() => {
                resource.clear()?;
                Ok(ClearOutcome::Cleared)
            }
            Some(_) => Ok(ClearOutcome::Replaced),
            None => Ok(ClearOutcome::AlreadyEmpty),
        }
    }

    /// `execute` against a slot whose lock the caller already holds.
    pub(crate) fn fire_locked(&self, slot: &LockedSlot<'_>) -> Result<ClearOutcome, ResourceError> {
        if self.generation.is_some_and(|g| g != slot.generation()) {
            return Ok(ClearOutcome::Superseded);
        }
        self.execute(slot.resource())
    }
}

impl fmt::Debug for ClearTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClearTask")
            .field("slot", &self.slot)
            .field("expected", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Run a task against its slot in `registry`, under the slot lock.
///
/// Returns `None` when the registry has no such slot.
pub fn fire(task: &ClearTask, registry: &SlotRegistry) -> Option<ClearOutcome> {
    let result = registry.with_locked(task.slot(), |slot| task.fire_locked(&slot));
    report(task.slot(), result)
}

pub(crate) fn report(
    slot: &SlotId,
    result: Option<Result<ClearOutcome, ResourceError>>,
) -> Option<ClearOutcome> {
    match result {
        Some(Ok(outcome)) => {
            match outcome {
                ClearOutcome::Cleared => info!(slot = %slot, "Cleared exposed value"),
                other => debug!(slot = %slot, outcome = ?other, "Left slot untouched"),
            }
            Some(outcome)
        }
        Some(Err(e)) => {
            warn!(slot = %slot, error = %e, "Scheduled clear failed");
            None
        }
        None => {
            warn!(slot = %slot, "Scheduled clear for unknown slot");
            None
        }
    }
}
