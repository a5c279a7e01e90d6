//! Exposure scheduler
//!
//! `expose` puts a value into a slot's resource and arms exactly one clear
//! for that slot. Exposing again before the deadline cancels the armed
//! clear and arms a new one relative to the newer call.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::slot::{SlotId, SlotRegistry};
use crate::task::ClearTask;
use crate::timer::{DelayedTaskScheduler, ScheduledClear};
use crate::ExposureError;

/// Default exposure window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// Result of a successful `expose`.
#[derive(Debug)]
#[must_use]
pub enum ExposeOutcome {
    /// The value is in the resource and a clear is armed for `deadline`.
    Guarded { deadline: Instant },
    /// The value is in the resource but no clear could be armed. Best
    /// effort only: surface this as a warning.
    Unguarded(ExposureError),
}

impl ExposeOutcome {
    pub fn is_guarded(&self) -> bool {
        matches!(self, ExposeOutcome::Guarded { .. })
    }
}

struct PendingClear {
    deadline: Instant,
    handle: Box<dyn ScheduledClear>,
}

pub struct ExposureScheduler {
    registry: Arc<SlotRegistry>,
    timer: Arc<dyn DelayedTaskScheduler>,
    window: Duration,
    pending: Mutex<HashMap<SlotId, PendingClear>>,
}

impl ExposureScheduler {
    pub fn new(registry: Arc<SlotRegistry>, timer: Arc<dyn DelayedTaskScheduler>, window: Duration) -> Self {
        Self {
            registry,
            timer,
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Write `value` to the slot (flagged sensitive) and arm its clear,
    /// replacing any clear still armed for the slot.
    ///
    /// Errors only when the slot is unknown or the write itself fails. A
    /// scheduling failure still exposes the value and comes back as
    /// [`ExposeOutcome::Unguarded`].
    pub fn expose(&self, slot: &SlotId, value: &str) -> Result<ExposeOutcome, ExposureError> {
        self.registry
            .with_locked(slot, |mut locked| -> Result<ExposeOutcome, ExposureError> {
                let mut pending = self.pending.lock();
                if let Some(previous) = pending.remove(slot) {
                    previous.handle.cancel();
                    debug!(slot = %slot, "Cancelled superseded clear");
                }
                let generation = locked.advance();

                // Write and arm as one step for every process sharing the slot
                let held = self.timer.lock_slot(slot);
                locked.resource().write(value, true)?;
                let _held = match held {
                    Ok(held) => held,
                    Err(e) => {
                        warn!(slot = %slot, error = %e, "Exposed value without auto-clear");
                        return Ok(ExposeOutcome::Unguarded(e));
                    }
                };

                let Some(deadline) = Instant::now().checked_add(self.window) else {
                    let e = ExposureError::SchedulingUnavailable(format!(
                        "exposure window of {}s is out of range",
                        self.window.as_secs()
                    ));
                    warn!(slot = %slot, error = %e, "Exposed value without auto-clear");
                    return Ok(ExposeOutcome::Unguarded(e));
                };

                let task = ClearTask::new(slot.clone(), value).with_generation(generation);
                match self.timer.schedule(task, self.window) {
                    Ok(handle) => {
                        pending.insert(slot.clone(), PendingClear { deadline, handle });
                        info!(slot = %slot, window_secs = self.window.as_secs(), "Exposed value, clear armed");
                        Ok(ExposeOutcome::Guarded { deadline })
                    }
                    Err(e) => {
                        warn!(slot = %slot, error = %e, "Exposed value without auto-clear");
                        Ok(ExposeOutcome::Unguarded(e))
                    }
                }
            })
            .ok_or_else(|| ExposureError::UnknownSlot(slot.clone()))?
    }

    pub fn is_pending(&self, slot: &SlotId) -> bool {
        self.pending
            .lock()
            .get(slot)
            .map(|p| p.handle.is_pending())
            .unwrap_or(false)
    }

    /// Deadline of the clear armed for `slot`, if one is still pending
    pub fn deadline(&self, slot: &SlotId) -> Option<Instant> {
        self.pending
            .lock()
            .get(slot)
            .filter(|p| p.handle.is_pending())
            .map(|p| p.deadline)
    }

    /// Number of clears still waiting to fire, across all slots
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().filter(|p| p.handle.is_pending()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{MemoryResource, SharedResource};
    use crate::timer::TokioTimer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clipboard: Arc<MemoryResource>,
        selection: Arc<MemoryResource>,
        scheduler: ExposureScheduler,
    }

    fn fixture() -> Fixture {
        let clipboard = Arc::new(MemoryResource::new());
        let selection = Arc::new(MemoryResource::new());
        let registry = Arc::new(
            SlotRegistry::new()
                .with_slot(SlotId::clipboard(), clipboard.clone())
                .with_slot(SlotId::new("selection"), selection.clone()),
        );
        let timer = Arc::new(TokioTimer::new(registry.clone()));
        Fixture {
            clipboard,
            selection,
            scheduler: ExposureScheduler::new(registry, timer, DEFAULT_WINDOW),
        }
    }

    async fn advance_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_after_window() {
        let f = fixture();
        let outcome = f.scheduler.expose(&SlotId::clipboard(), "hunter2").unwrap();
        assert!(outcome.is_guarded());
        assert!(f.clipboard.is_sensitive());

        advance_secs(29).await;
        assert_eq!(f.clipboard.current().as_deref(), Some("hunter2"));
        assert!(f.scheduler.is_pending(&SlotId::clipboard()));

        advance_secs(2).await;
        assert_eq!(f.clipboard.current(), None);
        assert_eq!(f.scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_expose_supersedes_first() {
        let f = fixture();
        let slot = SlotId::clipboard();

        let _ = f.scheduler.expose(&slot, "v1").unwrap();
        advance_secs(10).await;
        let second = f.scheduler.expose(&slot, "v2").unwrap();

        assert_eq!(f.scheduler.pending_count(), 1);
        let ExposeOutcome::Guarded { deadline } = second else {
            panic!("second expose was not guarded");
        };
        assert_eq!(f.scheduler.deadline(&slot), Some(deadline));

        // First deadline passes without touching v2
        advance_secs(25).await;
        assert_eq!(f.clipboard.current().as_deref(), Some("v2"));
        assert_eq!(f.clipboard.clear_count(), 0);

        // Second deadline clears exactly once
        advance_secs(6).await;
        assert_eq!(f.clipboard.current(), None);
        assert_eq!(f.clipboard.clear_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_value_twice_clears_once_at_second_deadline() {
        let f = fixture();
        let slot = SlotId::clipboard();

        let _ = f.scheduler.expose(&slot, "hunter2").unwrap();
        advance_secs(10).await;
        let _ = f.scheduler.expose(&slot, "hunter2").unwrap();

        advance_secs(21).await;
        assert_eq!(f.clipboard.current().as_deref(), Some("hunter2"));
        assert_eq!(f.clipboard.clear_count(), 0);

        advance_secs(10).await;
        assert_eq!(f.clipboard.current(), None);
        assert_eq!(f.clipboard.clear_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_value_survives_clear() {
        let f = fixture();
        let slot = SlotId::clipboard();

        let _ = f.scheduler.expose(&slot, "v1").unwrap();
        let _ = f.scheduler.expose(&slot, "v2").unwrap();
        f.clipboard.write("v3", false).unwrap();

        advance_secs(31).await;
        assert_eq!(f.clipboard.current().as_deref(), Some("v3"));
        assert_eq!(f.clipboard.clear_count(), 0);
        assert_eq!(f.scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_independent() {
        let f = fixture();

        let _ = f.scheduler.expose(&SlotId::clipboard(), "a").unwrap();
        advance_secs(20).await;
        let _ = f.scheduler.expose(&SlotId::new("selection"), "b").unwrap();
        assert_eq!(f.scheduler.pending_count(), 2);

        advance_secs(11).await;
        assert_eq!(f.clipboard.current(), None);
        assert_eq!(f.selection.current().as_deref(), Some("b"));

        advance_secs(20).await;
        assert_eq!(f.selection.current(), None);
    }

    #[tokio::test]
    async fn test_unknown_slot_is_error() {
        let f = fixture();
        let result = f.scheduler.expose(&SlotId::new("nowhere"), "x");
        assert!(matches!(result, Err(ExposureError::UnknownSlot(_))));
    }

    struct RejectingTimer(AtomicUsize);

    impl DelayedTaskScheduler for RejectingTimer {
        fn schedule(&self, _task: ClearTask, _delay: Duration) -> Result<Box<dyn ScheduledClear>, ExposureError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ExposureError::SchedulingUnavailable("job queue full".to_string()))
        }
    }

    #[test]
    fn test_scheduling_failure_still_exposes() {
        let clipboard = Arc::new(MemoryResource::new());
        let registry = Arc::new(SlotRegistry::new().with_slot(SlotId::clipboard(), clipboard.clone()));
        let timer = Arc::new(RejectingTimer(AtomicUsize::new(0)));
        let scheduler = ExposureScheduler::new(registry, timer.clone(), DEFAULT_WINDOW);

        let outcome = scheduler.expose(&SlotId::clipboard(), "hunter2").unwrap();

        assert!(matches!(
            outcome,
            ExposeOutcome::Unguarded(ExposureError::SchedulingUnavailable(_))
        ));
        assert_eq!(clipboard.current().as_deref(), Some("hunter2"));
        assert_eq!(timer.0.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_window_past_clock_range_is_unguarded() {
        let clipboard = Arc::new(MemoryResource::new());
        let registry = Arc::new(SlotRegistry::new().with_slot(SlotId::clipboard(), clipboard.clone()));
        let timer = Arc::new(RejectingTimer(AtomicUsize::new(0)));
        let scheduler = ExposureScheduler::new(registry, timer.clone(), Duration::from_secs(u64::MAX));

        let outcome = scheduler.expose(&SlotId::clipboard(), "hunter2").unwrap();

        assert!(matches!(
            outcome,
            ExposeOutcome::Unguarded(ExposureError::SchedulingUnavailable(_))
        ));
        assert_eq!(clipboard.current().as_deref(), Some("hunter2"));
        assert_eq!(timer.0.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
