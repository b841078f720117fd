//! Module Exports
//!
//! Actuator control for the robot: shared task types plus the two control
//! layers built on them.
//!
//! - `device`: generic per-actuator task lifecycle (IDLE/RUNNING/COMPLETED/ERROR)
//! - `wheels`: slew-limited drive wheel motion control and bus framing

pub mod device;
pub mod wheels;

use serde::{Deserialize, Serialize};

pub use device::{DeviceStateMachine, Lifecycle};
pub use wheels::{WheelsConfig, WheelsController};

/// The closed set of actuators on the robot. Dispatch is by match, never by
/// dynamic dispatch: the hardware set is known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Wheels,
    Arm,
    Neck,
}

impl Actuator {
    pub const ALL: [Actuator; 3] = [Actuator::Wheels, Actuator::Arm, Actuator::Neck];

    pub fn name(self) -> &'static str {
        match self {
            Actuator::Wheels => "wheels",
            Actuator::Arm => "arm",
            Actuator::Neck => "neck",
        }
    }
}

/// What a task asks its actuator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Drive,
    MoveAngle,
}

/// One operator task, immutable once accepted. Wheels tasks use
/// `left`/`right`; arm and neck tasks use `angle`. `duration_ms == 0`
/// selects the device default duration. For wheels it instead means a
/// continuous task that only live updates or timeouts will end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub task_id: String,
    pub device: Actuator,
    #[serde(rename = "type", default = "CommandKind::default_for_wire")]
    pub kind: CommandKind,
    #[serde(default)]
    pub angle: u16,
    #[serde(default)]
    pub left: i16,
    #[serde(default)]
    pub right: i16,
    #[serde(default)]
    pub duration_ms: u32,
}

impl CommandKind {
    fn default_for_wire() -> CommandKind {
        CommandKind::Drive
    }
}
