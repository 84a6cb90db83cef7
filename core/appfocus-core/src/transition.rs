//! Maps lifecycle signals to foreground/background transitions.
//! Conservative rules: only a stop of the most recently resumed screen, after
//! a pause and with nothing resumed since, counts as leaving the foreground.

use serde::Serialize;

use crate::types::TransitionKind;

/// The two persisted flags. `{foreground: false, paused: true}` is the
/// initial background state; `{true, false}` is foreground and active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForegroundState {
    pub is_foreground: bool,
    pub is_paused: bool,
}

impl Default for ForegroundState {
    fn default() -> Self {
        Self {
            is_foreground: false,
            is_paused: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Resumed,
    Paused,
    /// `is_last_resumed`: the stopped screen is the one this process resumed last.
    Stopped { is_last_resumed: bool },
}

pub fn next_state(
    current: ForegroundState,
    signal: Signal,
) -> (ForegroundState, Option<TransitionKind>) {
    match signal {
        Signal::Resumed => {
            let emitted = (!current.is_foreground).then_some(TransitionKind::ToForeground);
            (
                ForegroundState {
                    is_foreground: true,
                    is_paused: false,
                },
                emitted,
            )
        }
        Signal::Paused => (
            ForegroundState {
                is_paused: true,
                ..current
            },
            None,
        ),
        Signal::Stopped { is_last_resumed } => {
            if is_last_resumed && current.is_paused && current.is_foreground {
                (
                    ForegroundState {
                        is_foreground: false,
                        ..current
                    },
                    Some(TransitionKind::ToBackground),
                )
            } else {
                (current, None)
            }
        }
    }
}
