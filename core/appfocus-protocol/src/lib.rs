//! Broadcast bus message types and validation for appfocus.
//!
//! This crate is shared by every publisher and receiver on the bus to prevent
//! schema drift between processes built at different times. Receivers remain
//! the authority on validation: a message that fails [`BusMessage::validate`]
//! is dropped before it reaches any listener.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024; // 64KB

/// Action id every transition message is published under.
pub const BROADCAST_ACTION: &str = "app.foreground.background.switch";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AppForeground,
    AppBackground,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AppForeground => "app_foreground",
            EventKind::AppBackground => "app_background",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BusMessage {
    pub protocol_version: u32,
    pub action: String,
    pub event_id: String,
    pub recorded_at: String,
    pub event_kind: EventKind,
    pub screen_id: String,
    #[serde(default)]
    pub origin_process: Option<String>,
    #[serde(default)]
    pub origin_pid: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl BusMessage {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ErrorInfo::new(
                "protocol_mismatch",
                format!(
                    "unsupported protocol version {} (expected {})",
                    self.protocol_version, PROTOCOL_VERSION
                ),
            ));
        }

        if self.action != BROADCAST_ACTION {
            return Err(ErrorInfo::new(
                "unknown_action",
                format!("unexpected action {}", self.action),
            ));
        }

        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        if self.origin_pid == Some(0) {
            return Err(ErrorInfo::new("invalid_pid", "origin_pid must be non-zero"));
        }

        Ok(())
    }
}

/// Decodes one newline-stripped frame off the bus and validates it.
pub fn parse_message(bytes: &[u8]) -> Result<BusMessage, ErrorInfo> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            "message exceeded maximum size",
        ));
    }
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_message", "message body was empty"));
    }

    let message: BusMessage = serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("message was not valid JSON: {}", err),
        )
    })?;
    message.validate()?;
    Ok(message)
}
