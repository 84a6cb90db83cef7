//! Per-process entry point wiring lock, store, bus and detector together.
//!
//! Each process of the app creates one [`AppFocusMonitor`] at startup and feeds
//! it the host's screen lifecycle callbacks. Transitions detected in any
//! process reach the listeners registered in every process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use appfocus_protocol::BusMessage;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;

use crate::broadcast::{Broadcaster, LocalBroadcaster};
use crate::bus::{EventBus, ListenerScope, TransitionListener};
use crate::config::{AppHandle, MonitorConfig, Transport};
use crate::detector::TransitionDetector;
use crate::error::{FocusError, Result};
use crate::identity::ProcessIdentity;
use crate::lock::{LockStats, ProcessMutex};
use crate::logging;
use crate::store::{FileStore, SharedStore, KEY_IS_FOREGROUND, KEY_IS_PAUSED};
use crate::transition::ForegroundState;
use crate::types::{LifecycleEvent, ScreenId};

const DISPATCH_POLL_MS: u64 = 100;

/// Builds an [`AppFocusMonitor`], optionally with injected collaborators.
pub struct MonitorBuilder {
    app: AppHandle,
    config: Option<MonitorConfig>,
    identity: Option<ProcessIdentity>,
    store: Option<Arc<dyn SharedStore>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl MonitorBuilder {
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn build(self) -> Result<AppFocusMonitor> {
        let app = self.app;
        let config = match self.config {
            Some(config) => config,
            None => MonitorConfig::load(&app)?,
        };

        let log_guard = if config.log_to_file {
            logging::init(Some(app.log_dir().as_path()))?
        } else {
            None
        };

        let identity = self.identity.unwrap_or_else(|| match &app.process_name {
            Some(name) => ProcessIdentity::named(name.clone()),
            None => ProcessIdentity::current().clone(),
        });

        let mutex = Arc::new(ProcessMutex::with_timeouts(
            app.lock_path(),
            config.lock_timeout(),
            config.poll_interval(),
        ));
        let store: Arc<dyn SharedStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::new(app.state_path())),
        };
        let broadcaster = match self.broadcaster {
            Some(broadcaster) => broadcaster,
            None => default_broadcaster(&app, config.transport),
        };

        let bus = Arc::new(EventBus::new(identity.clone()));
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = spawn_dispatcher(
            broadcaster.subscribe()?,
            Arc::clone(&bus),
            Arc::clone(&stop),
        )?;

        let detector = TransitionDetector::spawn(
            Arc::clone(&mutex),
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            identity.clone(),
        )?;
        if identity.is_main_process() {
            detector.reset_foreground();
        }

        info!(
            app_id = %app.app_id,
            process = identity.display_name(),
            pid = identity.pid(),
            is_main_process = identity.is_main_process(),
            transport = ?config.transport,
            "App focus monitor initialized"
        );

        Ok(AppFocusMonitor {
            app,
            config,
            identity,
            mutex,
            store,
            bus,
            detector: Some(detector),
            dispatcher: Some(dispatcher),
            stop,
            _broadcaster: broadcaster,
            _log_guard: log_guard,
        })
    }
}

pub struct AppFocusMonitor {
    app: AppHandle,
    config: MonitorConfig,
    identity: ProcessIdentity,
    mutex: Arc<ProcessMutex>,
    store: Arc<dyn SharedStore>,
    bus: Arc<EventBus>,
    detector: Option<TransitionDetector>,
    dispatcher: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    // Dropped after the dispatcher stops, which closes this process's bus
    // subscription.
    _broadcaster: Arc<dyn Broadcaster>,
    _log_guard: Option<WorkerGuard>,
}

impl AppFocusMonitor {
    /// Starts monitoring for this process with the configuration found under
    /// the app's data directory.
    pub fn initialize(app: AppHandle) -> Result<Self> {
        Self::builder(app).build()
    }

    pub fn builder(app: AppHandle) -> MonitorBuilder {
        MonitorBuilder {
            app,
            config: None,
            identity: None,
            store: None,
            broadcaster: None,
        }
    }

    pub fn app(&self) -> &AppHandle {
        &self.app
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        debug!(
            screen_id = %event.screen(),
            event = event.name(),
            process = self.identity.display_name(),
            "Screen lifecycle event"
        );
        let Some(detector) = self.detector.as_ref() else {
            return;
        };
        match event {
            LifecycleEvent::Resumed(screen) => detector.on_resumed(screen),
            LifecycleEvent::Paused(screen) => detector.on_paused(screen),
            LifecycleEvent::Stopped(screen) => detector.on_stopped(screen),
            LifecycleEvent::Created(_)
            | LifecycleEvent::Started(_)
            | LifecycleEvent::Destroyed(_) => {}
        }
    }

    pub fn on_screen_resumed(&self, screen: impl Into<ScreenId>) {
        self.handle_lifecycle(LifecycleEvent::Resumed(screen.into()));
    }

    pub fn on_screen_paused(&self, screen: impl Into<ScreenId>) {
        self.handle_lifecycle(LifecycleEvent::Paused(screen.into()));
    }

    pub fn on_screen_stopped(&self, screen: impl Into<ScreenId>) {
        self.handle_lifecycle(LifecycleEvent::Stopped(screen.into()));
    }

    pub fn register_listener(
        &self,
        scope: ListenerScope,
        listener: Arc<dyn TransitionListener>,
    ) -> bool {
        self.bus.register(scope, listener)
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn TransitionListener>) -> bool {
        self.bus.unregister(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.bus.listener_count()
    }

    /// Shared flags as last persisted by any process. Read without the process
    /// lock, so it may trail an update in flight.
    pub fn shared_state(&self) -> ForegroundState {
        ForegroundState {
            is_foreground: self.store.get_bool(KEY_IS_FOREGROUND, false),
            is_paused: self.store.get_bool(KEY_IS_PAUSED, true),
        }
    }

    /// Blocks until lifecycle events handed over so far have been applied and
    /// published. Delivery to listeners stays asynchronous.
    pub fn flush(&self) {
        if let Some(detector) = self.detector.as_ref() {
            detector.flush();
        }
    }

    pub fn lock_stats(&self) -> LockStats {
        self.mutex.stats()
    }

    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if let Some(detector) = self.detector.take() {
            detector.shutdown();
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
            debug!(process = self.identity.display_name(), "App focus monitor stopped");
        }
    }
}

impl Drop for AppFocusMonitor {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn default_broadcaster(app: &AppHandle, transport: Transport) -> Arc<dyn Broadcaster> {
    match transport {
        #[cfg(unix)]
        Transport::Socket => Arc::new(crate::broadcast::SocketBroadcaster::new(app.bus_dir())),
        #[cfg(not(unix))]
        Transport::Socket => {
            tracing::warn!(
                bus_dir = %app.bus_dir().display(),
                "Socket transport unavailable on this platform; using local bus"
            );
            Arc::new(LocalBroadcaster::new())
        }
        Transport::Local => Arc::new(LocalBroadcaster::new()),
    }
}

fn spawn_dispatcher(
    rx: Receiver<BusMessage>,
    bus: Arc<EventBus>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("appfocus-dispatch".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(DISPATCH_POLL_MS)) {
                    Ok(message) => {
                        bus.dispatch(&message);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(|source| FocusError::WorkerSpawn {
            name: "bus dispatcher".to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::listener_fn;
    use crate::store::MemoryStore;
    use crate::types::TransitionKind;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn recv_kind(rx: &mpsc::Receiver<(TransitionKind, bool)>) -> Option<(TransitionKind, bool)> {
        rx.recv_timeout(Duration::from_secs(2)).ok()
    }

    #[test]
    fn main_process_reports_foreground_then_background() {
        let temp = tempdir().unwrap();
        let app = AppHandle::with_data_dir("com.example.app", temp.path())
            .with_process_name("com.example.app");
        let config = MonitorConfig {
            transport: Transport::Local,
            ..MonitorConfig::default()
        };
        let monitor = AppFocusMonitor::builder(app).config(config).build().unwrap();
        assert!(monitor.identity().is_main_process());

        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let listener = listener_fn(move |event| {
            let _ = tx.lock().unwrap().send((event.kind, event.is_main_process));
        });
        assert!(monitor.register_listener(ListenerScope::MainProcessOnly, listener));

        monitor.on_screen_resumed("A");
        assert_eq!(recv_kind(&rx), Some((TransitionKind::ToForeground, true)));
        assert!(monitor.shared_state().is_foreground);

        monitor.on_screen_paused("A");
        monitor.on_screen_stopped("A");
        assert_eq!(recv_kind(&rx), Some((TransitionKind::ToBackground, true)));
        assert_eq!(monitor.shared_state(), ForegroundState::default());

        monitor.flush();
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.lock_stats().timeouts, 0);
        monitor.shutdown();
    }

    #[test]
    fn startup_resets_stale_foreground_only_in_main_process() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put_bool(KEY_IS_FOREGROUND, true).unwrap();
        let bus: Arc<dyn Broadcaster> = Arc::new(LocalBroadcaster::new());

        let secondary = AppFocusMonitor::builder(AppHandle::with_data_dir("app", temp.path()))
            .identity(ProcessIdentity::named("com.example.app:sync"))
            .store(store.clone())
            .broadcaster(Arc::clone(&bus))
            .config(MonitorConfig::default())
            .build()
            .unwrap();
        secondary.flush();
        assert!(secondary.shared_state().is_foreground);

        let main = AppFocusMonitor::builder(AppHandle::with_data_dir("app", temp.path()))
            .identity(ProcessIdentity::named("com.example.app"))
            .store(store.clone())
            .broadcaster(bus)
            .config(MonitorConfig::default())
            .build()
            .unwrap();
        main.flush();
        assert!(!main.shared_state().is_foreground);
    }

    #[test]
    fn created_started_destroyed_do_not_touch_state() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let monitor = AppFocusMonitor::builder(AppHandle::with_data_dir("app", temp.path()))
            .identity(ProcessIdentity::named("com.example.app"))
            .store(store)
            .broadcaster(Arc::new(LocalBroadcaster::new()))
            .config(MonitorConfig::default())
            .build()
            .unwrap();

        monitor.handle_lifecycle(LifecycleEvent::Created("A".into()));
        monitor.handle_lifecycle(LifecycleEvent::Started("A".into()));
        monitor.handle_lifecycle(LifecycleEvent::Destroyed("A".into()));
        monitor.flush();
        assert_eq!(monitor.shared_state(), ForegroundState::default());
    }
}
