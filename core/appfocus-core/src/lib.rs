//! # appfocus-core
//!
//! Decides whether a multi-process application as a whole is in the
//! foreground or the background, and tells every process when that changes.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Work runs on a few named
//!   threads per process (detector worker, bus receiver, dispatcher).
//! - **One writer per process**: lifecycle signals are applied by a single
//!   worker, under a cross-process file lock.
//! - **Graceful degradation**: lock timeouts skip one update, unreadable state
//!   reads as the defaults, a bus without subscribers is not an error. Nothing
//!   here panics the host.
//! - **Seams as traits**: [`SharedStore`] and [`Broadcaster`] stand in for the
//!   host's durable store and broadcast mechanism.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use appfocus_core::{AppFocusMonitor, AppHandle, ListenerScope, listener_fn};
//!
//! let monitor = AppFocusMonitor::initialize(AppHandle::new("com.example.app")?)?;
//! monitor.register_listener(
//!     ListenerScope::AllProcesses,
//!     listener_fn(|event| println!("{:?} via {}", event.kind, event.screen_id)),
//! );
//! monitor.on_screen_resumed("MainScreen@1");
//! ```

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod detector;
pub mod error;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod monitor;
pub mod store;
pub mod transition;
pub mod types;

pub use broadcast::{Broadcaster, LocalBroadcaster};
#[cfg(unix)]
pub use broadcast::SocketBroadcaster;
pub use bus::{listener_fn, EventBus, FnListener, ListenerScope, TransitionListener};
pub use config::{AppHandle, MonitorConfig, Transport};
pub use detector::TransitionDetector;
pub use error::{FocusError, Result};
pub use identity::ProcessIdentity;
pub use lock::{LockStats, ProcessMutex, ProcessMutexGuard};
pub use monitor::{AppFocusMonitor, MonitorBuilder};
pub use store::{FileStore, MemoryStore, SharedStore, KEY_IS_FOREGROUND, KEY_IS_PAUSED};
pub use transition::ForegroundState;
pub use types::{LifecycleEvent, ScreenId, TransitionEvent, TransitionKind};
