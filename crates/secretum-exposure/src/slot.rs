//! Slots and the shared resources behind them

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Name of a shared resource that can hold an exposed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub const CLIPBOARD: &'static str = "clipboard";

    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn clipboard() -> Self {
        Self::new(Self::CLIPBOARD)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared-resource collaborator (the system clipboard, typically).
pub trait SharedResource: Send + Sync {
    /// Replace the contents. `sensitive` asks the platform to suppress
    /// previews and history where it supports that.
    fn write(&self, value: &str, sensitive: bool) -> Result<(), ResourceError>;

    /// Current contents as raw bytes, `None` when empty. Contents that are
    /// not valid UTF-8 are returned as they are, never lossily converted.
    fn read_current(&self) -> Result<Option<Zeroizing<Vec<u8>>>, ResourceError>;

    fn clear(&self) -> Result<(), ResourceError>;
}

struct Slot {
    resource: Arc<dyn SharedResource>,
    generation: Mutex<u64>,
}

/// A slot's resource, seen from inside the slot lock.
pub struct LockedSlot<'a> {
    resource: &'a dyn SharedResource,
    generation: &'a mut u64,
}

impl LockedSlot<'_> {
    pub fn resource(&self) -> &dyn SharedResource {
        self.resource
    }

    /// Number of exposures the slot has seen in this process
    pub fn generation(&self) -> u64 {
        *self.generation
    }

    /// Start a new exposure. Clears armed for earlier generations become
    /// stale.
    pub fn advance(&mut self) -> u64 {
        *self.generation += 1;
        *self.generation
    }
}

/// Maps slot ids to their resources.
///
/// Each slot carries its own lock. Exposing a value and firing a clear for
/// the same slot both run under it; different slots never contend.
#[derive(Default)]
pub struct SlotRegistry {
    slots: HashMap<SlotId, Slot>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, slot: SlotId, resource: Arc<dyn SharedResource>) -> Self {
        self.slots.insert(
            slot,
            Slot {
                resource,
                generation: Mutex::new(0),
            },
        );
        self
    }

    pub fn contains(&self, slot: &SlotId) -> bool {
        self.slots.contains_key(slot)
    }

    /// Run `f` against the slot's resource while holding the slot lock.
    /// Returns `None` for an unknown slot.
    pub fn with_locked<R>(&self, slot: &SlotId, f: impl FnOnce(LockedSlot<'_>) -> R) -> Option<R> {
        let entry = self.slots.get(slot)?;
        let mut generation = entry.generation.lock();
        Some(f(LockedSlot {
            resource: entry.resource.as_ref(),
            generation: &mut *generation,
        }))
    }
}

#[derive(Default)]
struct MemoryState {
    value: Option<Zeroizing<String>>,
    sensitive: bool,
    clears: usize,
}

/// In-memory stand-in for a clipboard.
#[derive(Default)]
pub struct MemoryResource {
    state: Mutex<MemoryState>,
}

impl MemoryResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current contents
    pub fn current(&self) -> Option<String> {
        self.state.lock().value.as_ref().map(|v| v.to_string())
    }

    /// Whether the last write was flagged sensitive
    pub fn is_sensitive(&self) -> bool {
        self.state.lock().sensitive
    }

    /// How many times the resource has been cleared
    pub fn clear_count(&self) -> usize {
        self.state.lock().clears
    }
}

impl SharedResource for MemoryResource {
    fn write(&self, value: &str, sensitive: bool) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.value = Some(Zeroizing::new(value.to_string()));
        state.sensitive = sensitive;
        Ok(())
    }

    fn read_current(&self) -> Result<Option<Zeroizing<Vec<u8>>>, ResourceError> {
        Ok(self
            .state
            .lock()
            .value
            .as_ref()
            .map(|v| Zeroizing::new(v.as_bytes().to_vec())))
    }

    fn clear(&self) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.value = None;
        state.sensitive = false;
        state.clears += 1;
        Ok(())
    }
}
