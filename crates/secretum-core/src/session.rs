//! Session lock
//!
//! The vault only reveals plaintext while the session is unlocked. Unlocking
//! consumes the yes/no result of whatever authentication prompt the front
//! end shows; the session itself never authenticates anyone.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::vault::VaultError;

#[derive(Debug)]
pub struct Session {
    unlocked: AtomicBool,
}

impl Session {
    /// A new session starts locked.
    pub fn new() -> Self {
        Self {
            unlocked: AtomicBool::new(false),
        }
    }

    /// Returns whether the session is now unlocked. A failed prompt leaves
    /// the current state alone.
    pub fn unlock(&self, authenticated: bool) -> bool {
        if authenticated {
            if !self.unlocked.swap(true, Ordering::SeqCst) {
                info!("Session unlocked");
            }
            true
        } else {
            self.is_unlocked()
        }
    }

    pub fn lock(&self) {
        if self.unlocked.swap(false, Ordering::SeqCst) {
            info!("Session locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    pub fn ensure_unlocked(&self) -> Result<(), VaultError> {
        if self.is_unlocked() {
            Ok(())
        } else {
            Err(VaultError::Locked)
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_locked() {
        let session = Session::new();
        assert!(!session.is_unlocked());
        assert!(matches!(session.ensure_unlocked(), Err(VaultError::Locked)));
    }

    #[test]
    fn test_failed_prompt_does_not_unlock() {
        let session = Session::new();
        assert!(!session.unlock(false));
        assert!(!session.is_unlocked());
    }

    #[test]
    fn test_unlock_then_lock() {
        let session = Session::new();
        assert!(session.unlock(true));
        assert!(session.ensure_unlocked().is_ok());

        session.lock();
        assert!(!session.is_unlocked());
    }
}
