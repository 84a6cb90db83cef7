//! Shared types for lifecycle input and transition output.

use std::fmt;

use appfocus_protocol::EventKind;
use serde::{Deserialize, Serialize};

/// Stable identifier of one screen instance.
///
/// Two instances of the same screen type must carry different ids: the
/// background debounce compares instances, not types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScreenId(String);

impl ScreenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScreenId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ScreenId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Raw per-screen callbacks from the host UI. Only `Resumed`, `Paused` and
/// `Stopped` drive foreground detection; the rest are observed for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created(ScreenId),
    Started(ScreenId),
    Resumed(ScreenId),
    Paused(ScreenId),
    Stopped(ScreenId),
    Destroyed(ScreenId),
}

impl LifecycleEvent {
    pub fn screen(&self) -> &ScreenId {
        match self {
            LifecycleEvent::Created(screen)
            | LifecycleEvent::Started(screen)
            | LifecycleEvent::Resumed(screen)
            | LifecycleEvent::Paused(screen)
            | LifecycleEvent::Stopped(screen)
            | LifecycleEvent::Destroyed(screen) => screen,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Created(_) => "created",
            LifecycleEvent::Started(_) => "started",
            LifecycleEvent::Resumed(_) => "resumed",
            LifecycleEvent::Paused(_) => "paused",
            LifecycleEvent::Stopped(_) => "stopped",
            LifecycleEvent::Destroyed(_) => "destroyed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    ToForeground,
    ToBackground,
}

impl From<TransitionKind> for EventKind {
    fn from(kind: TransitionKind) -> Self {
        match kind {
            TransitionKind::ToForeground => EventKind::AppForeground,
            TransitionKind::ToBackground => EventKind::AppBackground,
        }
    }
}

impl From<EventKind> for TransitionKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::AppForeground => TransitionKind::ToForeground,
            EventKind::AppBackground => TransitionKind::ToBackground,
        }
    }
}

/// One delivered transition, as seen by a listener in the receiving process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub kind: TransitionKind,
    pub screen_id: String,
    pub process_name: String,
    pub is_main_process: bool,
}
