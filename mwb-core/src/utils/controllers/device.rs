//! Generic actuator task lifecycle.
//!
//! One [`DeviceStateMachine`] exists per actuator for the life of the
//! process. It owns the active task slot and nothing else: actual motion is
//! the wheels controller's business, and arm/neck are plain duration timers
//! behind external servo hardware.
//!
//! Lifecycle: `Idle -> Running -> {Completed, Error} -> Idle`. `finish` is
//! the dispatcher's acknowledgment that a terminal state was consumed.

use tracing::debug;

use super::{Actuator, TaskEnvelope};

/// Tasks shorter than this are stretched to avoid start/stop races.
pub const MIN_TASK_DURATION_MS: u32 = 100;
/// Default duration for arm/neck tasks that do not carry one.
pub const DEFAULT_TIMED_DURATION_MS: u32 = 800;
/// Progress reported for a continuous wheels task while it runs.
const CONTINUOUS_PROGRESS_PCT: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
    Completed,
    Error,
}

/// Task lifecycle state for a single actuator.
///
/// Invariant: `active` is `Some` exactly while the lifecycle is `Running`
/// or `Completed`.
pub struct DeviceStateMachine {
    device: Actuator,
    lifecycle: Lifecycle,
    active: Option<TaskEnvelope>,
    start_ms: u64,
    duration_ms: u32,
    /// Continuous tasks never self-complete.
    continuous: bool,
}

impl DeviceStateMachine {
    pub fn new(device: Actuator) -> Self {
        DeviceStateMachine {
            device,
            lifecycle: Lifecycle::Idle,
            active: None,
            start_ms: 0,
            duration_ms: 0,
            continuous: false,
        }
    }

    pub fn device(&self) -> Actuator {
        self.device
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn active_task(&self) -> Option<&TaskEnvelope> {
        self.active.as_ref()
    }

    pub fn current_task_id(&self) -> Option<&str> {
        self.active.as_ref().map(|t| t.task_id.as_str())
    }

    /// Begin a task, interrupting whatever was in flight. Valid from any state.
    pub fn start_task(&mut self, task: TaskEnvelope, now_ms: u64) {
        self.continuous = self.device == Actuator::Wheels && task.duration_ms == 0;
        self.duration_ms = effective_duration(self.device, task.duration_ms);
        self.start_ms = now_ms;
        debug!(
            device = self.device.name(),
            task_id = %task.task_id,
            duration_ms = self.duration_ms,
            continuous = self.continuous,
            "task started"
        );
        self.active = Some(task);
        self.lifecycle = Lifecycle::Running;
    }

    /// Live-update the running task's parameters without a stop/start cycle.
    /// Used for wheels, where restarting per drive command would cause
    /// visible motor jitter. The duration is softly extended so a stream of
    /// updates keeps the task alive.
    pub fn update_task(&mut self, task: &TaskEnvelope, now_ms: u64) -> bool {
        if self.lifecycle != Lifecycle::Running {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        active.left = task.left;
        active.right = task.right;
        active.angle = task.angle;
        if !self.continuous {
            let min_dur = if task.duration_ms >= MIN_TASK_DURATION_MS {
                task.duration_ms
            } else {
                3 * MIN_TASK_DURATION_MS
            };
            let elapsed = now_ms.saturating_sub(self.start_ms) as u32;
            self.duration_ms = self.duration_ms.max(elapsed.saturating_add(min_dur));
        }
        true
    }

    /// While running, complete once the duration has elapsed. Returns `true`
    /// on the tick that transitions to `Completed`.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if self.lifecycle != Lifecycle::Running || self.continuous {
            return false;
        }
        if now_ms.saturating_sub(self.start_ms) >= u64::from(self.duration_ms) {
            self.lifecycle = Lifecycle::Completed;
            return true;
        }
        false
    }

    /// Abort a running task. The task slot is cleared; the caller reports
    /// the failure upstream using the id it grabbed beforehand.
    pub fn cancel(&mut self, now_ms: u64) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        debug!(
            device = self.device.name(),
            elapsed_ms = now_ms.saturating_sub(self.start_ms),
            "task cancelled"
        );
        self.active = None;
        self.lifecycle = Lifecycle::Error;
    }

    /// Consume a terminal state and return to `Idle`.
    pub fn finish(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Completed | Lifecycle::Error) {
            self.active = None;
            self.lifecycle = Lifecycle::Idle;
        }
    }

    /// Task progress in percent: 0 while idle, elapsed/duration while
    /// running (continuous tasks pin to 50), 100 once completed.
    pub fn progress(&self, now_ms: u64) -> u8 {
        match self.lifecycle {
            Lifecycle::Idle | Lifecycle::Error => 0,
            Lifecycle::Completed => 100,
            Lifecycle::Running => {
                if self.continuous {
                    return CONTINUOUS_PROGRESS_PCT;
                }
                if self.duration_ms == 0 {
                    return 0;
                }
                let elapsed = now_ms.saturating_sub(self.start_ms);
                (elapsed * 100 / u64::from(self.duration_ms)).min(100) as u8
            }
        }
    }
}

fn effective_duration(device: Actuator, requested_ms: u32) -> u32 {
    match (device, requested_ms) {
        (Actuator::Wheels, 0) => 0,
        (_, 0) => DEFAULT_TIMED_DURATION_MS,
        (_, ms) => ms.max(MIN_TASK_DURATION_MS),
    }
}
