//! Line codec for the command/status protocol.
//!
//! Wire format: UTF-8, one compact JSON object per line, `\n` terminated.
//!
//! ```text
//! → {"command":"assign_device","command_id":"c1","device_index":0}
//! ← {"status":"camera_assigned","in_reply_to":"c1","data":{"device_id":"sim-camera-0"}}
//! ```

use crate::error::{AppResult, RecorderError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Command sent by the master to a module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Command verb, e.g. `start_recording`
    pub command: String,
    /// Correlation id; present means a reply is expected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// Remaining fields of the object
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Status sent by a module to the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Status verb, e.g. `recording_started`, `error`
    pub status: String,
    /// Id of the command this answers; absent for unsolicited pushes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A line that could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct DecodeError {
    /// What went wrong
    pub message: String,
    /// Command id recovered from the raw line, if any
    pub command_id: Option<String>,
}

impl From<DecodeError> for RecorderError {
    fn from(err: DecodeError) -> Self {
        RecorderError::Protocol(err.message)
    }
}

static COMMAND_ID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#""command_id"\s*:\s*(?:"((?:[^"\\]|\\.)*)"|(-?\d+))"#).ok()
});

impl CommandMessage {
    /// Command without parameters.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            command_id: None,
            params: Map::new(),
        }
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.command_id = Some(id.into());
        self
    }

    /// Attach a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Typed parameter lookup; `Ok(None)` when absent.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                RecorderError::Protocol(format!("invalid parameter '{}': {}", key, e))
            }),
        }
    }

    /// Typed parameter lookup that fails when absent.
    pub fn required<T: DeserializeOwned>(&self, key: &str) -> AppResult<T> {
        self.param(key)?
            .ok_or_else(|| RecorderError::Protocol(format!("missing parameter '{}'", key)))
    }
}

impl StatusMessage {
    /// Unsolicited status.
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            in_reply_to: None,
            data: None,
        }
    }

    /// Status answering `command_id` (or unsolicited when `None`).
    pub fn reply(status: impl Into<String>, in_reply_to: Option<String>) -> Self {
        Self {
            status: status.into(),
            in_reply_to,
            data: None,
        }
    }

    /// `error` status carrying `{"message": ...}`.
    pub fn error(in_reply_to: Option<String>, message: impl Into<String>) -> Self {
        Self::reply("error", in_reply_to)
            .with_data(serde_json::json!({ "message": message.into() }))
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// True when this answers a command.
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }

    /// True for `error` statuses.
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// Serialize a message into exactly one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> AppResult<String> {
    // compact serde_json output never contains a raw newline
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one command line.
pub fn decode_command(line: &str) -> Result<CommandMessage, DecodeError> {
    let trimmed = line.trim();
    let value: Value = serde_json::from_str(trimmed).map_err(|e| DecodeError {
        message: format!("malformed JSON: {}", e),
        command_id: salvage_command_id(trimmed),
    })?;

    if !value.is_object() {
        return Err(DecodeError {
            message: "command must be a JSON object".to_string(),
            command_id: None,
        });
    }

    serde_json::from_value::<CommandMessage>(value).map_err(|e| DecodeError {
        message: format!("invalid command: {}", e),
        command_id: salvage_command_id(trimmed),
    })
}

/// Decode one status line.
pub fn decode_status(line: &str) -> Result<StatusMessage, DecodeError> {
    serde_json::from_str(line.trim()).map_err(|e| DecodeError {
        message: format!("invalid status: {}", e),
        command_id: None,
    })
}

/// Recover a `command_id` from a line that is not valid JSON.
pub fn salvage_command_id(line: &str) -> Option<String> {
    let pattern = COMMAND_ID_PATTERN.as_ref()?;
    let captures = pattern.captures(line)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
}
