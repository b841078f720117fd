//! Wire protocol: JSON envelopes exchanged with the operator over the
//! WebSocket session, one object per text frame, discriminated by `kind`.
//!
//! Inbound envelopes are validated here before they reach dispatch;
//! out-of-range values are rejected with an error report, not clamped
//! (a garbled 500% drive command should fail loudly, not drive at full
//! speed).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::controllers::{Actuator, TaskEnvelope};

/// Upper bound on any inbound drive/task duration.
pub const MAX_DURATION_MS: u32 = 60_000;

/// Messages the operator sends us.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind")]
pub enum Inbound {
    /// Informational; no action.
    #[serde(rename = "hello")]
    Hello,
    /// Live wheel command.
    #[serde(rename = "drive")]
    Drive {
        left: i32,
        right: i32,
        #[serde(default, rename = "durationMs")]
        duration_ms: u32,
    },
    #[serde(rename = "task.replace")]
    TaskReplace { tasks: Vec<TaskEnvelope> },
    #[serde(rename = "task.enqueue")]
    TaskEnqueue { tasks: Vec<TaskEnvelope> },
    #[serde(rename = "task.cancel")]
    TaskCancel { device: Actuator },
    /// Application-level liveness probe; `t` is echoed back.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        t: u64,
    },
}

/// Messages we send the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Outbound {
    #[serde(rename = "hello")]
    Hello {
        id: String,
        fw: String,
        rssi: i32,
        ip: String,
    },
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "taskId")]
        task_id: String,
        seq: u32,
    },
    #[serde(rename = "progress")]
    Progress {
        #[serde(rename = "taskId")]
        task_id: String,
        pct: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    #[serde(rename = "done")]
    Done {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        message: String,
    },
    #[serde(rename = "pong")]
    Pong { t: u64 },
}

/// A single message or task failed validation; the rest of the loop keeps
/// running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{field} out of range")]
    OutOfRange { field: &'static str },
    #[error("invalid task data")]
    InvalidTask,
}

/// Parse one inbound text frame. Unknown `kind` values come back as
/// `Malformed` with the offending variant named in the message.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_outbound(msg: &Outbound) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Validate a live drive command. Percentages outside `-100..=100` are
/// rejected; the duration is capped, matching the documented wire contract.
pub fn validate_drive(
    left: i32,
    right: i32,
    duration_ms: u32,
) -> Result<(i16, i16, u32), ProtocolError> {
    if !(-100..=100).contains(&left) {
        return Err(ProtocolError::OutOfRange { field: "left" });
    }
    if !(-100..=100).contains(&right) {
        return Err(ProtocolError::OutOfRange { field: "right" });
    }
    Ok((left as i16, right as i16, duration_ms.min(MAX_DURATION_MS)))
}

/// Validate one task out of a batch. Returns a sanitized copy with the
/// duration capped.
pub fn validate_task(task: &TaskEnvelope) -> Result<TaskEnvelope, ProtocolError> {
    if task.task_id.is_empty() {
        return Err(ProtocolError::InvalidTask);
    }
    match task.device {
        Actuator::Wheels => {
            if !(-100..=100).contains(&task.left) {
                return Err(ProtocolError::OutOfRange { field: "left" });
            }
            if !(-100..=100).contains(&task.right) {
                return Err(ProtocolError::OutOfRange { field: "right" });
            }
        }
        Actuator::Arm | Actuator::Neck => {
            if task.angle > 180 {
                return Err(ProtocolError::OutOfRange { field: "angle" });
            }
        }
    }
    let mut sanitized = task.clone();
    sanitized.duration_ms = task.duration_ms.min(MAX_DURATION_MS);
    Ok(sanitized)
}
