//! Clears that survive the scheduling process
//!
//! A short-lived CLI cannot keep an in-process timer alive for the whole
//! exposure window. `DetachedTimer` spawns a helper process and hands it the
//! clear task as JSON over stdin, so the value never appears in argv.
//!
//! Supersede across processes goes through a per-slot token file: every
//! schedule writes a fresh token, and a helper only clears if its token is
//! still the current one when it wakes up.
//!
//! Token file and slot contents change together under an exclusive lock on
//! `<slot>.lock` next to the token. An expose holds it across the write and
//! the token install; a helper holds it across the token check, the clear
//! and the token removal.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::slot::{SlotId, SlotRegistry};
use crate::task::{report, ClearOutcome, ClearTask};
use crate::timer::{DelayedTaskScheduler, ScheduledClear};
use crate::ExposureError;

/// Exclusive advisory lock on one slot, shared by every process that uses
/// the same state directory. Released on drop.
#[derive(Debug)]
pub struct SlotFileLock {
    _file: File,
}

impl SlotFileLock {
    /// Block until the lock at `path` is ours, creating the file if needed.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
        file.lock()?;
        Ok(Self { _file: file })
    }
}

fn lock_path_for(token_path: &Path) -> PathBuf {
    token_path.with_extension("lock")
}

/// Spawns `program args..` for every scheduled clear.
pub struct DetachedTimer {
    program: PathBuf,
    args: Vec<String>,
    state_dir: PathBuf,
}

impl DetachedTimer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            state_dir: state_dir.into(),
        }
    }

    /// Re-invoke the running executable with `args` as the helper.
    pub fn current_exe(args: Vec<String>, state_dir: impl Into<PathBuf>) -> Result<Self, ExposureError> {
        let program = std::env::current_exe()
            .map_err(|e| ExposureError::SchedulingUnavailable(format!("cannot locate executable: {}", e)))?;
        Ok(Self::new(program, args, state_dir))
    }

    fn token_path(&self, slot: &SlotId) -> PathBuf {
        let name: String = slot
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.state_dir.join(format!("{}.pending", name))
    }
}

fn unavailable(context: &str, e: std::io::Error) -> ExposureError {
    ExposureError::SchedulingUnavailable(format!("{}: {}", context, e))
}

impl DelayedTaskScheduler for DetachedTimer {
    fn lock_slot(&self, slot: &SlotId) -> Result<Option<SlotFileLock>, ExposureError> {
        let path = lock_path_for(&self.token_path(slot));
        SlotFileLock::acquire(&path)
            .map(Some)
            .map_err(|e| unavailable("slot lock", e))
    }

    /// Installs the slot's token. Callers hold [`lock_slot`](Self::lock_slot)
    /// for the slot so the token matches what they just exposed.
    fn schedule(&self, task: ClearTask, delay: Duration) -> Result<Box<dyn ScheduledClear>, ExposureError> {
        fs::create_dir_all(&self.state_dir).map_err(|e| unavailable("state dir", e))?;

        let token = Uuid::new_v4().to_string();
        let token_path = self.token_path(task.slot());
        fs::write(&token_path, &token).map_err(|e| unavailable("token file", e))?;

        let job = DetachedJob {
            task,
            delay,
            token: token.clone(),
            token_path: token_path.clone(),
        };
        let payload = job.to_json()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                let _ = fs::remove_file(&token_path);
                unavailable("spawn helper", e)
            })?;

        let handed_over = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin"))
            .and_then(|mut stdin| stdin.write_all(&payload));
        if let Err(e) = handed_over {
            let _ = child.kill();
            let _ = fs::remove_file(&token_path);
            return Err(unavailable("hand over job", e));
        }

        debug!(slot = %job.task.slot(), pid = child.id(), "Spawned detached clear");
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(Box::new(DetachedClear { token, token_path }))
    }
}

struct DetachedClear {
    token: String,
    token_path: PathBuf,
}

impl ScheduledClear for DetachedClear {
    fn cancel(&self) {
        let _held = match SlotFileLock::acquire(&lock_path_for(&self.token_path)) {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, "Cannot lock slot to cancel detached clear");
                return;
            }
        };
        if token_is_current(&self.token_path, &self.token) {
            let _ = fs::remove_file(&self.token_path);
        }
    }

    fn is_pending(&self) -> bool {
        token_is_current(&self.token_path, &self.token)
    }
}

fn token_is_current(path: &Path, token: &str) -> bool {
    fs::read_to_string(path).map(|t| t.trim() == token).unwrap_or(false)
}

#[derive(Serialize)]
struct JobOut<'a> {
    slot: &'a SlotId,
    expected: &'a str,
    delay_ms: u64,
    token: &'a str,
    token_path: &'a Path,
}

#[derive(Deserialize)]
struct JobIn {
    slot: SlotId,
    expected: String,
    delay_ms: u64,
    token: String,
    token_path: PathBuf,
}

/// A clear task plus what the helper needs to honor supersede.
pub struct DetachedJob {
    task: ClearTask,
    delay: Duration,
    token: String,
    token_path: PathBuf,
}

impl DetachedJob {
    fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, ExposureError> {
        let wire = JobOut {
            slot: self.task.slot(),
            expected: self.task.expected(),
            delay_ms: u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX),
            token: &self.token,
            token_path: &self.token_path,
        };
        serde_json::to_vec(&wire)
            .map(Zeroizing::new)
            .map_err(|e| ExposureError::InvalidJob(e.to_string()))
    }

    /// Parse a job handed over by `DetachedTimer`.
    pub fn read_from(mut reader: impl Read) -> Result<Self, ExposureError> {
        let mut raw = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut raw)
            .map_err(|e| ExposureError::InvalidJob(e.to_string()))?;

        let wire: JobIn = serde_json::from_slice(&raw).map_err(|e| ExposureError::InvalidJob(e.to_string()))?;
        let expected = Zeroizing::new(wire.expected);

        Ok(Self {
            task: ClearTask::new(wire.slot, &expected),
            delay: Duration::from_millis(wire.delay_ms),
            token: wire.token,
            token_path: wire.token_path,
        })
    }

    pub fn slot(&self) -> &SlotId {
        self.task.slot()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleep out the delay, then clear unless superseded. Blocks the
    /// calling thread.
    pub fn run(self, registry: &SlotRegistry) -> Result<ClearOutcome, ExposureError> {
        std::thread::sleep(self.delay);

        let slot = self.task.slot();
        let lock_path = lock_path_for(&self.token_path);
        let result = registry
            .with_locked(slot, |locked| -> Result<_, ExposureError> {
                let _held = SlotFileLock::acquire(&lock_path).map_err(|e| ExposureError::Resource(e.into()))?;

                if !token_is_current(&self.token_path, &self.token) {
                    info!(slot = %slot, "Detached clear superseded");
                    return Ok(None);
                }

                let result = self.task.fire_locked(&locked);
                let _ = fs::remove_file(&self.token_path);
                Ok(Some(result))
            })
            .ok_or_else(|| ExposureError::UnknownSlot(slot.clone()))??;

        match result {
            None => Ok(ClearOutcome::Superseded),
            Some(Ok(outcome)) => {
                report(slot, Some(Ok(outcome)));
                Ok(outcome)
            }
            Some(Err(e)) => {
                warn!(slot = %slot, error = %e, "Detached clear failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ExposureScheduler;
    use crate::slot::{MemoryResource, ResourceError, SharedResource};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    fn try_lock_from_outside(path: &Path) -> bool {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.try_lock().is_ok()
    }

    fn job_for(dir: &Path, expected: &str, token: &str) -> DetachedJob {
        DetachedJob {
            task: ClearTask::new(SlotId::clipboard(), expected),
            delay: Duration::ZERO,
            token: token.to_string(),
            token_path: dir.join("clipboard.pending"),
        }
    }

    #[test]
    fn test_job_wire_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_for(dir.path(), "hunter2", "tok-1");

        let json = job.to_json().unwrap();
        let parsed = DetachedJob::read_from(json.as_slice()).unwrap();

        assert_eq!(parsed.slot(), &SlotId::clipboard());
        assert_eq!(parsed.task.expected(), "hunter2");
        assert_eq!(parsed.token, "tok-1");
        assert_eq!(parsed.delay(), Duration::ZERO);
    }

    #[test]
    fn test_malformed_job_is_rejected() {
        assert!(matches!(
            DetachedJob::read_from(&b"{not json"[..]),
            Err(ExposureError::InvalidJob(_))
        ));
    }

    #[test]
    fn test_current_job_clears_and_releases_token() {
        let dir = tempfile::tempdir().unwrap();
        let resource = Arc::new(MemoryResource::new());
        resource.write("hunter2", true).unwrap();
        let registry = SlotRegistry::new().with_slot(SlotId::clipboard(), resource.clone());

        let job = job_for(dir.path(), "hunter2", "tok-1");
        fs::write(&job.token_path, "tok-1").unwrap();
        let token_path = job.token_path.clone();

        assert_eq!(job.run(&registry).unwrap(), ClearOutcome::Cleared);
        assert_eq!(resource.current(), None);
        assert!(!token_path.exists());
    }

    #[test]
    fn test_superseded_job_leaves_resource() {
        let dir = tempfile::tempdir().unwrap();
        let resource = Arc::new(MemoryResource::new());
        resource.write("hunter2", true).unwrap();
        let registry = SlotRegistry::new().with_slot(SlotId::clipboard(), resource.clone());

        let job = job_for(dir.path(), "hunter2", "tok-1");
        fs::write(&job.token_path, "tok-2").unwrap();

        assert_eq!(job.run(&registry).unwrap(), ClearOutcome::Superseded);
        assert_eq!(resource.current().as_deref(), Some("hunter2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_schedule_supersedes_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let timer = DetachedTimer::new("cat", vec![], dir.path());

        let first = timer
            .schedule(ClearTask::new(SlotId::clipboard(), "v1"), Duration::from_secs(30))
            .unwrap();
        assert!(first.is_pending());

        let second = timer
            .schedule(ClearTask::new(SlotId::clipboard(), "v2"), Duration::from_secs(30))
            .unwrap();
        assert!(!first.is_pending());
        assert!(second.is_pending());

        // Cancelling a stale handle must not disturb the newer one
        first.cancel();
        assert!(second.is_pending());

        second.cancel();
        assert!(!second.is_pending());
    }

    #[test]
    fn test_missing_program_is_scheduling_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let timer = DetachedTimer::new("/nonexistent/secretum-helper", vec![], dir.path());

        let result = timer.schedule(ClearTask::new(SlotId::clipboard(), "v1"), Duration::from_secs(30));
        assert!(matches!(result, Err(ExposureError::SchedulingUnavailable(_))));
        assert!(!dir.path().join("clipboard.pending").exists());
    }

    #[test]
    fn test_slot_lock_excludes_other_holders() {
        let dir = tempfile::tempdir().unwrap();
        let timer = DetachedTimer::new("cat", vec![], dir.path());
        let lock_path = dir.path().join("clipboard.lock");

        let held = timer.lock_slot(&SlotId::clipboard()).unwrap().unwrap();
        assert!(!try_lock_from_outside(&lock_path));

        drop(held);
        assert!(try_lock_from_outside(&lock_path));
    }

    /// Clipboard whose first read races a second copy from another process:
    /// that copy takes the slot lock, writes `v2` and installs `tok-B`.
    struct ContendedClipboard {
        inner: Arc<MemoryResource>,
        lock_path: PathBuf,
        token_path: PathBuf,
        raced: AtomicBool,
        rival: Mutex<Option<JoinHandle<()>>>,
    }

    impl SharedResource for ContendedClipboard {
        fn write(&self, value: &str, sensitive: bool) -> Result<(), ResourceError> {
            self.inner.write(value, sensitive)
        }

        fn read_current(&self) -> Result<Option<Zeroizing<Vec<u8>>>, ResourceError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let inner = Arc::clone(&self.inner);
                let lock_path = self.lock_path.clone();
                let token_path = self.token_path.clone();
                *self.rival.lock() = Some(std::thread::spawn(move || {
                    let _held = SlotFileLock::acquire(&lock_path).unwrap();
                    inner.write("v2", true).unwrap();
                    fs::write(&token_path, "tok-B").unwrap();
                }));
                std::thread::sleep(Duration::from_millis(100));
            }
            self.inner.read_current()
        }

        fn clear(&self) -> Result<(), ResourceError> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_concurrent_copy_waits_for_running_clear() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(MemoryResource::new());
        inner.write("v1", true).unwrap();

        let job_a = job_for(dir.path(), "v1", "tok-A");
        let token_path = job_a.token_path.clone();
        fs::write(&token_path, "tok-A").unwrap();

        let clipboard = Arc::new(ContendedClipboard {
            inner: inner.clone(),
            lock_path: dir.path().join("clipboard.lock"),
            token_path: token_path.clone(),
            raced: AtomicBool::new(false),
            rival: Mutex::new(None),
        });
        let registry = SlotRegistry::new().with_slot(SlotId::clipboard(), clipboard.clone());

        // The rival copy is held off until this clear is done with the slot
        assert_eq!(job_a.run(&registry).unwrap(), ClearOutcome::Cleared);
        let rival = clipboard.rival.lock().take().unwrap();
        rival.join().unwrap();

        assert_eq!(inner.current().as_deref(), Some("v2"));
        assert_eq!(fs::read_to_string(&token_path).unwrap(), "tok-B");

        // The rival's own clear still finds its value and token
        let registry = SlotRegistry::new().with_slot(SlotId::clipboard(), inner.clone());
        let job_b = job_for(dir.path(), "v2", "tok-B");
        assert_eq!(job_b.run(&registry).unwrap(), ClearOutcome::Cleared);
        assert_eq!(inner.current(), None);
        assert!(!token_path.exists());
    }

    /// Records whether the slot lock was held by someone when written to
    struct LockWitness {
        inner: MemoryResource,
        lock_path: PathBuf,
        locked_during_write: AtomicBool,
    }

    impl SharedResource for LockWitness {
        fn write(&self, value: &str, sensitive: bool) -> Result<(), ResourceError> {
            self.locked_during_write
                .store(!try_lock_from_outside(&self.lock_path), Ordering::SeqCst);
            self.inner.write(value, sensitive)
        }

        fn read_current(&self) -> Result<Option<Zeroizing<Vec<u8>>>, ResourceError> {
            self.inner.read_current()
        }

        fn clear(&self) -> Result<(), ResourceError> {
            self.inner.clear()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_expose_writes_and_arms_under_slot_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("clipboard.lock");
        let witness = Arc::new(LockWitness {
            inner: MemoryResource::new(),
            lock_path: lock_path.clone(),
            locked_during_write: AtomicBool::new(false),
        });
        let registry = Arc::new(SlotRegistry::new().with_slot(SlotId::clipboard(), witness.clone()));
        let timer = Arc::new(DetachedTimer::new("cat", vec![], dir.path()));
        let scheduler = ExposureScheduler::new(registry, timer, Duration::from_secs(30));

        let outcome = scheduler.expose(&SlotId::clipboard(), "hunter2").unwrap();

        assert!(outcome.is_guarded());
        assert!(witness.locked_during_write.load(Ordering::SeqCst));
        assert!(try_lock_from_outside(&lock_path));
        assert!(scheduler.is_pending(&SlotId::clipboard()));
    }
}
