//! Foreground/background transition detection.
//!
//! Lifecycle signals are queued onto one worker thread per process, so they
//! are applied strictly in arrival order and at most one process-lock
//! acquisition per process is in flight. Each signal is a read-modify-write of
//! the shared flags under the [`ProcessMutex`]:
//!
//! ```text
//! on_resumed(S) ─▶ queue ─▶ lock ─▶ read flags ─▶ next_state
//!                                   ─▶ write flags ─▶ publish? ─▶ unlock
//! ```
//!
//! Transitions are published while the lock is still held, which keeps the
//! event stream totally ordered across processes.
//!
//! A lock failure skips that one signal (logged); the next lifecycle signal
//! re-evaluates from the persisted flags.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::bus::transition_message;
use crate::error::{FocusError, Result};
use crate::identity::ProcessIdentity;
use crate::lock::ProcessMutex;
use crate::store::{SharedStore, KEY_IS_FOREGROUND, KEY_IS_PAUSED};
use crate::transition::{next_state, ForegroundState, Signal};
use crate::types::{ScreenId, TransitionKind};

enum Command {
    ResetForeground,
    Resumed(ScreenId),
    Paused(ScreenId),
    Stopped(ScreenId),
    Flush(Sender<()>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::ResetForeground => "reset_foreground",
            Command::Resumed(_) => "resumed",
            Command::Paused(_) => "paused",
            Command::Stopped(_) => "stopped",
            Command::Flush(_) => "flush",
        }
    }
}

pub struct TransitionDetector {
    tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl TransitionDetector {
    pub fn spawn(
        mutex: Arc<ProcessMutex>,
        store: Arc<dyn SharedStore>,
        broadcaster: Arc<dyn Broadcaster>,
        identity: ProcessIdentity,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let mut worker = Worker {
            mutex,
            store,
            broadcaster,
            identity,
            last_resumed: None,
        };

        let handle = thread::Builder::new()
            .name("appfocus-detector".to_string())
            .spawn(move || {
                for command in rx {
                    worker.handle(command);
                }
                debug!("Transition detector stopped");
            })
            .map_err(|source| FocusError::WorkerSpawn {
                name: "transition detector".to_string(),
                source,
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(handle),
        })
    }

    /// Forces `is_foreground = false`. Only the main process calls this, once
    /// at startup, to clear a value left over from a crashed run.
    pub fn reset_foreground(&self) {
        self.enqueue(Command::ResetForeground);
    }

    pub fn on_resumed(&self, screen: ScreenId) {
        self.enqueue(Command::Resumed(screen));
    }

    pub fn on_paused(&self, screen: ScreenId) {
        self.enqueue(Command::Paused(screen));
    }

    pub fn on_stopped(&self, screen: ScreenId) {
        self.enqueue(Command::Stopped(screen));
    }

    /// Blocks until every signal queued before this call has been applied.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.enqueue(Command::Flush(done_tx)) {
            let _ = done_rx.recv();
        }
    }

    /// Applies everything still queued, then stops the worker.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn enqueue(&self, command: Command) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        let name = command.name();
        if tx.send(command).is_err() {
            warn!(command = name, "Transition detector is not running; dropping signal");
            return false;
        }
        true
    }

    fn stop_worker(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Transition detector worker panicked");
            }
        }
    }
}

impl Drop for TransitionDetector {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

struct Worker {
    mutex: Arc<ProcessMutex>,
    store: Arc<dyn SharedStore>,
    broadcaster: Arc<dyn Broadcaster>,
    identity: ProcessIdentity,
    last_resumed: Option<ScreenId>,
}

impl Worker {
    fn handle(&mut self, command: Command) {
        let name = command.name();
        let outcome = match command {
            Command::ResetForeground => self.reset_foreground(),
            Command::Resumed(screen) => self.resumed(screen),
            Command::Paused(screen) => self.apply(Signal::Paused, &screen),
            Command::Stopped(screen) => {
                let is_last_resumed = self.last_resumed.as_ref() == Some(&screen);
                self.apply(Signal::Stopped { is_last_resumed }, &screen)
            }
            Command::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_lock_failure() => warn!(
                error = %err,
                command = name,
                process = self.identity.display_name(),
                "Process lock unavailable; skipped lifecycle update"
            ),
            Err(err) => warn!(
                error = %err,
                command = name,
                process = self.identity.display_name(),
                "Shared state update failed; skipped lifecycle update"
            ),
        }
    }

    fn reset_foreground(&self) -> Result<()> {
        let _guard = self.mutex.acquire()?;
        self.store.put_bool(KEY_IS_FOREGROUND, false)?;
        info!(
            process = self.identity.display_name(),
            "Reset shared foreground flag at startup"
        );
        Ok(())
    }

    fn resumed(&mut self, screen: ScreenId) -> Result<()> {
        let mutex = Arc::clone(&self.mutex);
        let _guard = mutex.acquire()?;
        self.last_resumed = Some(screen.clone());
        self.transition_locked(Signal::Resumed, &screen)
    }

    fn apply(&self, signal: Signal, screen: &ScreenId) -> Result<()> {
        let _guard = self.mutex.acquire()?;
        self.transition_locked(signal, screen)
    }

    // Caller holds the process lock.
    fn transition_locked(&self, signal: Signal, screen: &ScreenId) -> Result<()> {
        let current = ForegroundState {
            is_foreground: self.store.get_bool(KEY_IS_FOREGROUND, false),
            is_paused: self.store.get_bool(KEY_IS_PAUSED, true),
        };
        let (next, emitted) = next_state(current, signal);

        if matches!(signal, Signal::Resumed | Signal::Paused) {
            self.store.put_bool(KEY_IS_PAUSED, next.is_paused)?;
        }
        if next.is_foreground != current.is_foreground {
            self.store.put_bool(KEY_IS_FOREGROUND, next.is_foreground)?;
        }

        debug!(
            screen_id = %screen,
            signal = ?signal,
            is_foreground = next.is_foreground,
            is_paused = next.is_paused,
            "Applied lifecycle signal"
        );

        if let Some(kind) = emitted {
            self.publish(kind, screen);
        }
        Ok(())
    }

    fn publish(&self, kind: TransitionKind, screen: &ScreenId) {
        let message = transition_message(kind, screen, &self.identity);
        info!(
            event_kind = message.event_kind.as_str(),
            screen_id = %screen,
            process = self.identity.display_name(),
            event_id = %message.event_id,
            "App transition detected"
        );
        match self.broadcaster.publish(&message) {
            Ok(0) => debug!(event_id = %message.event_id, "No bus subscribers for transition"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Failed to publish app transition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBroadcaster;
    use crate::store::MemoryStore;
    use appfocus_protocol::{BusMessage, EventKind};
    use std::sync::mpsc::Receiver;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _temp: TempDir,
        store: Arc<MemoryStore>,
        mutex: Arc<ProcessMutex>,
        detector: TransitionDetector,
        rx: Receiver<BusMessage>,
    }

    fn harness() -> Harness {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBroadcaster::new());
        let rx = bus.subscribe().unwrap();
        let mutex = Arc::new(ProcessMutex::with_timeouts(
            temp.path().join("process.lock"),
            Duration::from_millis(200),
            Duration::from_millis(10),
        ));
        let detector = TransitionDetector::spawn(
            Arc::clone(&mutex),
            store.clone(),
            bus,
            ProcessIdentity::named("com.example.app"),
        )
        .unwrap();
        Harness {
            _temp: temp,
            store,
            mutex,
            detector,
            rx,
        }
    }

    fn emitted(h: &Harness) -> Vec<EventKind> {
        h.detector.flush();
        h.rx.try_iter().map(|message| message.event_kind).collect()
    }

    #[test]
    fn test_navigation_between_screens_stays_foreground() {
        let h = harness();
        h.detector.on_resumed("S1".into());
        h.detector.on_paused("S1".into());
        h.detector.on_resumed("S2".into());
        h.detector.on_paused("S2".into());
        h.detector.on_stopped("S1".into());

        assert_eq!(emitted(&h), vec![EventKind::AppForeground]);
        assert!(h.store.get_bool(KEY_IS_FOREGROUND, false));
    }

    #[test]
    fn test_pause_then_stop_of_last_screen_goes_background() {
        let h = harness();
        h.detector.on_resumed("S1".into());
        h.detector.on_paused("S1".into());
        h.detector.on_stopped("S1".into());

        assert_eq!(
            emitted(&h),
            vec![EventKind::AppForeground, EventKind::AppBackground]
        );
        assert!(!h.store.get_bool(KEY_IS_FOREGROUND, true));
        assert!(h.store.get_bool(KEY_IS_PAUSED, false));
    }

    #[test]
    fn test_repeated_resume_emits_once() {
        let h = harness();
        h.detector.on_resumed("S1".into());
        h.detector.on_resumed("S1".into());
        assert_eq!(emitted(&h), vec![EventKind::AppForeground]);
    }

    #[test]
    fn test_reset_clears_stale_foreground() {
        let h = harness();
        h.store.put_bool(KEY_IS_FOREGROUND, true).unwrap();

        h.detector.reset_foreground();
        h.detector.flush();
        assert!(!h.store.get_bool(KEY_IS_FOREGROUND, true));

        h.detector.on_resumed("S1".into());
        assert_eq!(emitted(&h), vec![EventKind::AppForeground]);
    }

    #[test]
    fn test_lock_timeout_skips_signal() {
        let h = harness();
        let rival = ProcessMutex::new(h.mutex.path());
        rival.lock().unwrap();

        h.detector.on_resumed("S1".into());
        assert!(emitted(&h).is_empty());
        assert!(!h.store.get_bool(KEY_IS_FOREGROUND, false));
        assert_eq!(h.mutex.stats().timeouts, 1);

        rival.unlock();
        h.detector.on_resumed("S1".into());
        assert_eq!(emitted(&h), vec![EventKind::AppForeground]);
    }

    #[test]
    fn test_resume_skipped_on_timeout_does_not_become_last_resumed() {
        let h = harness();
        h.detector.on_resumed("S0".into());
        assert_eq!(emitted(&h), vec![EventKind::AppForeground]);

        let rival = ProcessMutex::new(h.mutex.path());
        rival.lock().unwrap();
        h.detector.on_resumed("S1".into());
        h.detector.flush();
        rival.unlock();

        h.detector.on_paused("S1".into());
        h.detector.on_stopped("S1".into());
        assert!(emitted(&h).is_empty());
        assert!(h.store.get_bool(KEY_IS_FOREGROUND, false));

        h.detector.on_stopped("S0".into());
        assert_eq!(emitted(&h), vec![EventKind::AppBackground]);
    }

    #[test]
    fn test_failed_store_write_is_skipped_not_fatal() {
        let temp = tempdir().unwrap();
        // A directory where the state file should be makes every write fail.
        let state_path = temp.path().join("state.json");
        std::fs::create_dir_all(state_path.join("blocked")).unwrap();
        let bus = Arc::new(LocalBroadcaster::new());
        let rx = bus.subscribe().unwrap();
        let detector = TransitionDetector::spawn(
            Arc::new(ProcessMutex::new(temp.path().join("process.lock"))),
            Arc::new(crate::store::FileStore::new(&state_path)),
            bus,
            ProcessIdentity::named("com.example.app"),
        )
        .unwrap();

        detector.on_resumed("S1".into());
        detector.on_paused("S1".into());
        detector.flush();
        assert_eq!(rx.try_iter().count(), 0);
        detector.shutdown();
    }

    #[test]
    fn test_stop_before_any_resume_is_ignored() {
        let h = harness();
        h.detector.on_paused("S1".into());
        h.detector.on_stopped("S1".into());
        assert!(emitted(&h).is_empty());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let h = harness();
        h.detector.on_resumed("S1".into());
        h.detector.shutdown();
        assert_eq!(h.rx.try_iter().count(), 1);
    }
}
