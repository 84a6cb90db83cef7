//! In-process listener registry and dispatch of bus messages.
//!
//! Every process runs one [`EventBus`]. Messages arriving from the broadcast
//! bus (including ones this process published) are handed to
//! [`EventBus::dispatch`], which invokes each registered listener with the
//! receiving process's own name and role.
//!
//! The listener list is copy-on-write: dispatch iterates a snapshot, so
//! listeners may register or unregister (themselves or others) from inside a
//! callback without deadlock and without skipping unrelated listeners.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use appfocus_protocol::{BusMessage, BROADCAST_ACTION, PROTOCOL_VERSION};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::identity::ProcessIdentity;
use crate::types::{ScreenId, TransitionEvent, TransitionKind};

/// Bus messages remembered for de-duplication.
const RECENT_EVENT_IDS: usize = 64;

pub trait TransitionListener: Send + Sync {
    fn on_app_to_foreground(&self, screen_id: &str, process_name: &str, is_main_process: bool);
    fn on_app_to_background(&self, screen_id: &str, process_name: &str, is_main_process: bool);
}

/// Adapts a closure into a [`TransitionListener`].
pub struct FnListener<F>(F);

impl<F> TransitionListener for FnListener<F>
where
    F: Fn(&TransitionEvent) + Send + Sync,
{
    fn on_app_to_foreground(&self, screen_id: &str, process_name: &str, is_main_process: bool) {
        (self.0)(&TransitionEvent {
            kind: TransitionKind::ToForeground,
            screen_id: screen_id.to_string(),
            process_name: process_name.to_string(),
            is_main_process,
        });
    }

    fn on_app_to_background(&self, screen_id: &str, process_name: &str, is_main_process: bool) {
        (self.0)(&TransitionEvent {
            kind: TransitionKind::ToBackground,
            screen_id: screen_id.to_string(),
            process_name: process_name.to_string(),
            is_main_process,
        });
    }
}

pub fn listener_fn<F>(f: F) -> Arc<dyn TransitionListener>
where
    F: Fn(&TransitionEvent) + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerScope {
    /// Registration is silently ignored outside the main process.
    MainProcessOnly,
    AllProcesses,
}

type ListenerList = Arc<Vec<Arc<dyn TransitionListener>>>;

pub struct EventBus {
    identity: ProcessIdentity,
    listeners: RwLock<ListenerList>,
    recent: Mutex<VecDeque<String>>,
}

impl EventBus {
    pub fn new(identity: ProcessIdentity) -> Self {
        Self {
            identity,
            listeners: RwLock::new(Arc::new(Vec::new())),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENT_IDS)),
        }
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Adds `listener` unless it is already registered. Returns whether the
    /// set changed.
    pub fn register(&self, scope: ListenerScope, listener: Arc<dyn TransitionListener>) -> bool {
        if scope == ListenerScope::MainProcessOnly && !self.identity.is_main_process() {
            debug!(
                process = self.identity.display_name(),
                "Ignoring main-process-only listener in secondary process"
            );
            return false;
        }

        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listeners.iter().any(|existing| same_listener(existing, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(listeners.len() + 1);
        next.extend(listeners.iter().cloned());
        next.push(listener);
        *listeners = Arc::new(next);
        true
    }

    pub fn unregister(&self, listener: &Arc<dyn TransitionListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !listeners.iter().any(|existing| same_listener(existing, listener)) {
            return false;
        }
        let next: Vec<_> = listeners
            .iter()
            .filter(|existing| !same_listener(existing, listener))
            .cloned()
            .collect();
        *listeners = Arc::new(next);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Delivers one bus message to every listener in this process. Returns the
    /// number of listeners invoked; a repeated `event_id` invokes none.
    pub fn dispatch(&self, message: &BusMessage) -> usize {
        if message.action != BROADCAST_ACTION {
            return 0;
        }
        if !self.remember(&message.event_id) {
            debug!(event_id = %message.event_id, "Ignoring duplicate bus message");
            return 0;
        }

        let kind = TransitionKind::from(message.event_kind);
        let process_name = self.identity.display_name();
        let is_main_process = self.identity.is_main_process();
        let listeners = self.snapshot();

        info!(
            event_kind = message.event_kind.as_str(),
            screen_id = %message.screen_id,
            origin = message.origin_process.as_deref().unwrap_or(""),
            process = process_name,
            listeners = listeners.len(),
            "Dispatching app transition"
        );

        for listener in listeners.iter() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| match kind {
                TransitionKind::ToForeground => {
                    listener.on_app_to_foreground(&message.screen_id, process_name, is_main_process)
                }
                TransitionKind::ToBackground => {
                    listener.on_app_to_background(&message.screen_id, process_name, is_main_process)
                }
            }));
            if delivered.is_err() {
                warn!(event_id = %message.event_id, "Transition listener panicked");
            }
        }
        listeners.len()
    }

    fn snapshot(&self) -> ListenerList {
        Arc::clone(
            &self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn remember(&self, event_id: &str) -> bool {
        let mut recent = self
            .recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if recent.iter().any(|seen| seen == event_id) {
            return false;
        }
        if recent.len() == RECENT_EVENT_IDS {
            recent.pop_front();
        }
        recent.push_back(event_id.to_string());
        true
    }
}

fn same_listener(a: &Arc<dyn TransitionListener>, b: &Arc<dyn TransitionListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Builds the bus message announcing `kind`, originating from `origin`.
pub fn transition_message(
    kind: TransitionKind,
    screen: &ScreenId,
    origin: &ProcessIdentity,
) -> BusMessage {
    BusMessage {
        protocol_version: PROTOCOL_VERSION,
        action: BROADCAST_ACTION.to_string(),
        event_id: ulid::Ulid::new().to_string(),
        recorded_at: Utc::now().to_rfc3339(),
        event_kind: kind.into(),
        screen_id: screen.as_str().to_string(),
        origin_process: origin.name().map(str::to_string),
        origin_pid: Some(origin.pid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<TransitionEvent>>>;

    fn recording_listener() -> (Arc<dyn TransitionListener>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let listener = listener_fn(move |event| sink.lock().unwrap().push(event.clone()));
        (listener, log)
    }

    fn foreground(screen: &str) -> BusMessage {
        transition_message(
            TransitionKind::ToForeground,
            &ScreenId::new(screen),
            &ProcessIdentity::named("com.example.app"),
        )
    }

    #[test]
    fn test_register_is_idempotent() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app"));
        let (listener, _) = recording_listener();

        assert!(bus.register(ListenerScope::AllProcesses, Arc::clone(&listener)));
        assert!(!bus.register(ListenerScope::AllProcesses, Arc::clone(&listener)));
        assert_eq!(bus.listener_count(), 1);

        assert!(bus.unregister(&listener));
        assert!(!bus.unregister(&listener));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_main_only_listener_ignored_in_secondary() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app:sync"));
        let (listener, log) = recording_listener();

        assert!(!bus.register(ListenerScope::MainProcessOnly, listener));
        bus.dispatch(&foreground("Home@1"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_main_only_listener_registered_in_main() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app"));
        let (listener, log) = recording_listener();

        assert!(bus.register(ListenerScope::MainProcessOnly, listener));
        assert_eq!(bus.dispatch(&foreground("Home@1")), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_reports_receiving_process() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app:sync"));
        let (listener, log) = recording_listener();
        bus.register(ListenerScope::AllProcesses, listener);

        bus.dispatch(&foreground("Home@1"));
        let background = transition_message(
            TransitionKind::ToBackground,
            &ScreenId::new("Home@1"),
            &ProcessIdentity::named("com.example.app"),
        );
        bus.dispatch(&background);

        let log = log.lock().unwrap();
        assert_eq!(
            log[0],
            TransitionEvent {
                kind: TransitionKind::ToForeground,
                screen_id: "Home@1".to_string(),
                process_name: "com.example.app:sync".to_string(),
                is_main_process: false,
            }
        );
        assert_eq!(log[1].kind, TransitionKind::ToBackground);
    }

    #[test]
    fn test_duplicate_event_id_dispatched_once() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app"));
        let (listener, log) = recording_listener();
        bus.register(ListenerScope::AllProcesses, listener);

        let message = foreground("Home@1");
        assert_eq!(bus.dispatch(&message), 1);
        assert_eq!(bus.dispatch(&message), 0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unregister_during_dispatch_keeps_others() {
        let bus = Arc::new(EventBus::new(ProcessIdentity::named("com.example.app")));
        let (victim, victim_log) = recording_listener();
        let (bystander, bystander_log) = recording_listener();

        let remover = {
            let bus = Arc::clone(&bus);
            let victim = Arc::clone(&victim);
            listener_fn(move |_| {
                bus.unregister(&victim);
            })
        };

        bus.register(ListenerScope::AllProcesses, remover);
        bus.register(ListenerScope::AllProcesses, Arc::clone(&victim));
        bus.register(ListenerScope::AllProcesses, bystander);

        // The snapshot taken for this dispatch still includes the victim.
        assert_eq!(bus.dispatch(&foreground("Home@1")), 3);
        assert_eq!(victim_log.lock().unwrap().len(), 1);
        assert_eq!(bystander_log.lock().unwrap().len(), 1);

        assert_eq!(bus.dispatch(&foreground("Home@2")), 2);
        assert_eq!(victim_log.lock().unwrap().len(), 1);
        assert_eq!(bystander_log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app"));
        let (listener, log) = recording_listener();
        bus.register(
            ListenerScope::AllProcesses,
            listener_fn(|_| panic!("listener bug")),
        );
        bus.register(ListenerScope::AllProcesses, listener);

        bus.dispatch(&foreground("Home@1"));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_action_is_ignored() {
        let bus = EventBus::new(ProcessIdentity::named("com.example.app"));
        let (listener, log) = recording_listener();
        bus.register(ListenerScope::AllProcesses, listener);

        let mut message = foreground("Home@1");
        message.action = "other.action".to_string();
        assert_eq!(bus.dispatch(&message), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transition_message_is_valid() {
        let message = foreground("Home@1");
        assert!(message.validate().is_ok());
        assert_eq!(message.origin_process.as_deref(), Some("com.example.app"));
        assert_eq!(message.origin_pid, Some(std::process::id()));
    }
}
