//! Reentrant, timeout-bounded process lock backed by an advisory file lock.
//!
//! Every process of the application opens the same well-known lock file
//! (`{data_dir}/lock/process.lock`) and contends for an exclusive advisory lock
//! on it. The OS offers no blocking wait with a deadline for these locks, so
//! acquisition polls:
//!
//! ```text
//! try_lock_exclusive ──ok──────────────▶ held (depth = 1)
//!        │
//!   contended ──elapsed < timeout──▶ sleep 10ms ──▶ retry
//!        │
//!        └────elapsed >= timeout──▶ LockTimeout
//! ```
//!
//! # Reentrancy
//!
//! Holds are tracked per thread. A thread that already holds the lock only bumps
//! its depth; the OS lock is taken on the first hold and released when the
//! last one drops. Each thread opens its own file handle, so threads of one
//! process contend with each other exactly like separate processes do.
//!
//! # Release
//!
//! [`ProcessMutex::unlock`] never fails. A stray unlock (no hold on the calling
//! thread) is logged and ignored; an OS-level release error is logged and the
//! handle is closed anyway, which releases the lock as a backstop.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;
use fs_err as fs;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{FocusError, Result};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Hold {
    depth: usize,
    file: fs::File,
}

#[derive(Default)]
struct Counters {
    os_acquisitions: AtomicU64,
    os_releases: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time lock counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub os_acquisitions: u64,
    pub os_releases: u64,
    pub timeouts: u64,
}

pub struct ProcessMutex {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    holds: Mutex<HashMap<ThreadId, Hold>>,
    counters: Counters,
}

impl ProcessMutex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_timeouts(path, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_timeouts(
        path: impl Into<PathBuf>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            timeout,
            // A zero interval would spin the CPU while contended.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            holds: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks until this thread owns the lock across all processes.
    ///
    /// Returns immediately when the calling thread already holds it. Every
    /// successful call must be matched by one [`unlock`](Self::unlock) on the
    /// same thread; prefer [`acquire`](Self::acquire) which does that on drop.
    pub fn lock(&self) -> Result<()> {
        let thread = thread::current().id();
        {
            let mut holds = self.holds();
            if let Some(hold) = holds.get_mut(&thread) {
                hold.depth += 1;
                trace!(depth = hold.depth, "Reentered process lock");
                return Ok(());
            }
        }

        // The map mutex is not held while polling: the owning thread must stay
        // free to reenter or unlock while others wait on the file.
        let file = self.acquire_os_lock()?;
        self.counters.os_acquisitions.fetch_add(1, Ordering::Relaxed);
        self.holds().insert(thread, Hold { depth: 1, file });
        Ok(())
    }

    /// Releases one level of the calling thread's hold.
    pub fn unlock(&self) {
        let thread = thread::current().id();
        let mut holds = self.holds();

        match holds.get_mut(&thread) {
            None => {
                warn!(
                    path = %self.path.display(),
                    "unlock called without a matching lock on this thread; ignoring"
                );
            }
            Some(hold) if hold.depth > 1 => {
                hold.depth -= 1;
                trace!(depth = hold.depth, "Released reentrant process lock level");
            }
            Some(_) => {
                if let Some(hold) = holds.remove(&thread) {
                    self.release_os_lock(hold);
                }
            }
        }
    }

    /// Scoped acquisition: the returned guard unlocks on drop, including
    /// during unwinding.
    pub fn acquire(&self) -> Result<ProcessMutexGuard<'_>> {
        self.lock()?;
        Ok(ProcessMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Runs `f` while holding the lock.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.acquire()?;
        Ok(f())
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holds().contains_key(&thread::current().id())
    }

    pub fn hold_depth(&self) -> usize {
        self.holds()
            .get(&thread::current().id())
            .map_or(0, |hold| hold.depth)
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            os_acquisitions: self.counters.os_acquisitions.load(Ordering::Relaxed),
            os_releases: self.counters.os_releases.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    fn holds(&self) -> MutexGuard<'_, HashMap<ThreadId, Hold>> {
        // Hold bookkeeping stays consistent across a panicking holder, so a
        // poisoned map is still usable.
        self.holds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_lock_file(&self) -> Result<fs::File> {
        let lock_io = |source: io::Error| FocusError::LockIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(lock_io)?;
        }

        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(lock_io)
    }

    fn acquire_os_lock(&self) -> Result<fs::File> {
        let file = self.open_lock_file()?;
        let started = Instant::now();
        let mut retries: u32 = 0;

        loop {
            match file.file().try_lock_exclusive() {
                Ok(()) => {
                    debug!(
                        path = %self.path.display(),
                        retries,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Acquired process lock"
                    );
                    return Ok(file);
                }
                Err(err) if is_contended(&err) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.timeout {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            path = %self.path.display(),
                            retries,
                            timeout_ms = self.timeout.as_millis() as u64,
                            "Timed out waiting for process lock"
                        );
                        return Err(FocusError::LockTimeout {
                            path: self.path.clone(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    retries += 1;
                    trace!(
                        path = %self.path.display(),
                        retries,
                        "Process lock held elsewhere; retrying"
                    );
                    thread::sleep(self.poll_interval.min(self.timeout - elapsed));
                }
                Err(source) => {
                    return Err(FocusError::LockIo {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn release_os_lock(&self, hold: Hold) {
        if let Err(err) = FileExt::unlock(hold.file.file()) {
            warn!(
                error = %err,
                path = %self.path.display(),
                "Failed to release process lock; closing handle"
            );
        }
        self.counters.os_releases.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), "Released process lock");
        drop(hold.file);
    }
}

impl std::fmt::Debug for ProcessMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMutex")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("stats", &self.stats())
            .finish()
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Releases one hold of a [`ProcessMutex`] when dropped.
///
/// Not `Send`: holds are per thread and must be released where they were taken.
#[must_use = "the process lock is released as soon as the guard is dropped"]
pub struct ProcessMutexGuard<'a> {
    mutex: &'a ProcessMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ProcessMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
