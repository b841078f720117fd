//! Task dispatch: one bounded queue and one lifecycle state machine per
//! actuator, plus the status callbacks that feed reports back to the
//! operator.
//!
//! Batches are acknowledged per task before anything runs, then partitioned
//! by device. A running wheels task is special-cased: new wheels commands
//! live-update it instead of queueing behind it, because drive commands
//! arrive at high frequency and a stop/restart cycle per command would
//! stutter the motors.

use heapless::Deque;
use tracing::{debug, info, warn};

use crate::utils::bus::BusPort;
use crate::utils::controllers::{
    device::MIN_TASK_DURATION_MS, Actuator, DeviceStateMachine, TaskEnvelope, WheelsController,
};

/// Per-actuator task queue capacity. Overflow is rejected, never dropped
/// silently.
pub const QUEUE_CAPACITY: usize = 10;
/// Minimum spacing between progress reports per running task.
pub const PROGRESS_INTERVAL_MS: u64 = 200;

/// Where dispatch status lands: acks, progress, completion, failures.
/// Implemented by the connectivity layer; tests substitute a recorder.
pub trait ReportSink {
    fn ack(&mut self, task_id: &str);
    fn progress(&mut self, task_id: &str, pct: u8, note: Option<&str>);
    fn done(&mut self, task_id: &str);
    fn error(&mut self, task_id: Option<&str>, message: &str);
}

/// Latest coalesced live drive command, applied once per control tick.
#[derive(Debug, Clone, Copy)]
struct PendingDrive {
    left: i16,
    right: i16,
    duration_ms: u32,
}

struct DeviceSlot {
    machine: DeviceStateMachine,
    queue: Deque<TaskEnvelope, QUEUE_CAPACITY>,
    last_progress_ms: u64,
}

impl DeviceSlot {
    fn new(device: Actuator) -> Self {
        DeviceSlot {
            machine: DeviceStateMachine::new(device),
            queue: Deque::new(),
            last_progress_ms: 0,
        }
    }
}

/// Owns the task queues and lifecycle machines for all actuators.
pub struct TaskDispatcher {
    wheels: DeviceSlot,
    arm: DeviceSlot,
    neck: DeviceSlot,
    pending_drive: Option<PendingDrive>,
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDispatcher {
    pub fn new() -> Self {
        TaskDispatcher {
            wheels: DeviceSlot::new(Actuator::Wheels),
            arm: DeviceSlot::new(Actuator::Arm),
            neck: DeviceSlot::new(Actuator::Neck),
            pending_drive: None,
        }
    }

    /// Replace all tasks for every device named in the batch: running and
    /// queued tasks are failed with reason `"replaced"`, then the batch is
    /// enqueued fresh.
    pub fn replace_tasks<P: BusPort>(
        &mut self,
        batch: &[TaskEnvelope],
        now_ms: u64,
        wheels_ctl: &mut WheelsController<P>,
        sink: &mut impl ReportSink,
    ) {
        self.accept(batch, false, now_ms, wheels_ctl, sink);
    }

    /// Append the batch behind whatever is queued. A running wheels task is
    /// live-updated instead.
    pub fn enqueue_tasks<P: BusPort>(
        &mut self,
        batch: &[TaskEnvelope],
        now_ms: u64,
        wheels_ctl: &mut WheelsController<P>,
        sink: &mut impl ReportSink,
    ) {
        self.accept(batch, true, now_ms, wheels_ctl, sink);
    }

    /// Coalesce a live drive command; only the latest one per control tick
    /// reaches the wheels.
    pub fn set_pending_drive(&mut self, left: i16, right: i16, duration_ms: u32) {
        self.pending_drive = Some(PendingDrive {
            left,
            right,
            duration_ms,
        });
    }

    /// Fail-safe a single actuator.
    pub fn cancel_device<P: BusPort>(
        &mut self,
        device: Actuator,
        now_ms: u64,
        wheels_ctl: &mut WheelsController<P>,
        sink: &mut impl ReportSink,
    ) {
        info!(device = device.name(), "cancel requested");
        match device {
            Actuator::Wheels => {
                clear_slot(&mut self.wheels, now_ms, Some(wheels_ctl), sink, "canceled")
            }
            Actuator::Arm => clear_slot::<P, _>(&mut self.arm, now_ms, None, sink, "canceled"),
            Actuator::Neck => clear_slot::<P, _>(&mut self.neck, now_ms, None, sink, "canceled"),
        }
    }

    /// Fail-safe every actuator. Called by the connectivity layer on session
    /// loss; the wheels get an immediate STOP frame.
    pub fn cancel_all<P: BusPort>(
        &mut self,
        reason: &str,
        now_ms: u64,
        wheels_ctl: &mut WheelsController<P>,
        sink: &mut impl ReportSink,
    ) {
        warn!(reason, "failing safe on all actuators");
        self.pending_drive = None;
        clear_slot(&mut self.wheels, now_ms, Some(wheels_ctl), sink, reason);
        clear_slot::<P, _>(&mut self.arm, now_ms, None, sink, reason);
        clear_slot::<P, _>(&mut self.neck, now_ms, None, sink, reason);
    }

    /// Advance every actuator: apply the coalesced drive command, emit
    /// progress at a bounded cadence, reap completed tasks and start the
    /// next queued one.
    pub fn tick<P: BusPort>(
        &mut self,
        now_ms: u64,
        wheels_ctl: &mut WheelsController<P>,
        sink: &mut impl ReportSink,
    ) {
        if let Some(drive) = self.pending_drive.take() {
            wheels_ctl.set_target(drive.left, drive.right, drive.duration_ms, now_ms);
            if let Some(active) = self.wheels.machine.active_task().cloned() {
                let live = TaskEnvelope {
                    left: drive.left,
                    right: drive.right,
                    duration_ms: drive.duration_ms,
                    ..active
                };
                self.wheels.machine.update_task(&live, now_ms);
            }
        } else if self.wheels.machine.is_running() {
            // A running wheels task is a standing command: keep it fresh so
            // the controller's silence watchdogs only fire on real loss.
            if let Some(active) = self.wheels.machine.active_task() {
                wheels_ctl.set_target(active.left, active.right, 0, now_ms);
            }
        }

        for device in Actuator::ALL {
            let slot = self.slot_mut(device);
            let completed = slot.machine.tick(now_ms);
            if slot.machine.is_running() {
                if now_ms.saturating_sub(slot.last_progress_ms) >= PROGRESS_INTERVAL_MS {
                    slot.last_progress_ms = now_ms;
                    if let Some(id) = slot.machine.current_task_id() {
                        let pct = slot.machine.progress(now_ms);
                        sink.progress(id, pct, None);
                    }
                }
            } else if completed {
                if let Some(id) = slot.machine.current_task_id().map(str::to_owned) {
                    sink.done(&id);
                }
                slot.machine.finish();
                let started_wheels = start_next(slot, now_ms);
                if device == Actuator::Wheels {
                    match started_wheels {
                        Some(task) => apply_wheels_task(wheels_ctl, &task, now_ms),
                        // Timed wheels task finished with nothing queued:
                        // ramp down now instead of waiting for the watchdog.
                        None => wheels_ctl.set_target(0, 0, 0, now_ms),
                    }
                }
            }
        }
    }

    /// Queue depth for an actuator, exposed for tests and telemetry.
    pub fn queue_len(&self, device: Actuator) -> usize {
        self.slot(device).queue.len()
    }

    pub fn machine(&self, device: Actuator) -> &DeviceStateMachine {
        &self.slot(device).machine
    }

    fn accept<P: BusPort>(
        &mut self,
        batch: &[TaskEnvelope],
        enqueue_mode: bool,
        now_ms: u64,
        wheels_ctl: &mut WheelsController<P>,
        sink: &mut impl ReportSink,
    ) {
        // Ack first, regardless of what happens to each task next.
        for task in batch {
            sink.ack(&task.task_id);
        }

        for device in Actuator::ALL {
            let affected = batch.iter().any(|t| t.device == device);
            if !affected {
                continue;
            }
            if !enqueue_mode {
                match device {
                    Actuator::Wheels => clear_slot(
                        &mut self.wheels,
                        now_ms,
                        Some(wheels_ctl),
                        sink,
                        "replaced",
                    ),
                    Actuator::Arm => {
                        clear_slot::<P, _>(&mut self.arm, now_ms, None, sink, "replaced")
                    }
                    Actuator::Neck => {
                        clear_slot::<P, _>(&mut self.neck, now_ms, None, sink, "replaced")
                    }
                }
            }

            for task in batch.iter().filter(|t| t.device == device) {
                let slot = self.slot_mut(device);
                // Live update path: a running wheels task absorbs the new
                // parameters and the task is confirmed done immediately.
                if device == Actuator::Wheels
                    && slot.machine.is_running()
                    && slot.machine.update_task(task, now_ms)
                {
                    wheels_ctl.set_target(task.left, task.right, capped(task.duration_ms), now_ms);
                    sink.done(&task.task_id);
                    continue;
                }
                if slot.queue.push_back(task.clone()).is_err() {
                    warn!(
                        device = device.name(),
                        task_id = %task.task_id,
                        "task queue full, rejecting"
                    );
                    sink.error(Some(&task.task_id), "task queue full");
                }
            }

            let slot = self.slot_mut(device);
            if !slot.machine.is_running() {
                let started = start_next(slot, now_ms);
                if device == Actuator::Wheels {
                    if let Some(task) = started {
                        apply_wheels_task(wheels_ctl, &task, now_ms);
                    }
                }
            }
        }
    }

    fn slot(&self, device: Actuator) -> &DeviceSlot {
        match device {
            Actuator::Wheels => &self.wheels,
            Actuator::Arm => &self.arm,
            Actuator::Neck => &self.neck,
        }
    }

    fn slot_mut(&mut self, device: Actuator) -> &mut DeviceSlot {
        match device {
            Actuator::Wheels => &mut self.wheels,
            Actuator::Arm => &mut self.arm,
            Actuator::Neck => &mut self.neck,
        }
    }
}

/// Start the next queued task, if any. Returns the task when the caller
/// needs to push it into the wheels controller.
fn start_next(slot: &mut DeviceSlot, now_ms: u64) -> Option<TaskEnvelope> {
    let next = slot.queue.pop_front()?;
    debug!(
        device = slot.machine.device().name(),
        task_id = %next.task_id,
        "starting queued task"
    );
    slot.machine.start_task(next.clone(), now_ms);
    slot.last_progress_ms = now_ms;
    Some(next)
}

fn apply_wheels_task<P: BusPort>(
    wheels_ctl: &mut WheelsController<P>,
    task: &TaskEnvelope,
    now_ms: u64,
) {
    wheels_ctl.set_target(task.left, task.right, capped(task.duration_ms), now_ms);
}

/// Cancel the running task and drain the queue, reporting an error with the
/// given reason for each dropped task.
fn clear_slot<P: BusPort, S: ReportSink + ?Sized>(
    slot: &mut DeviceSlot,
    now_ms: u64,
    wheels_ctl: Option<&mut WheelsController<P>>,
    sink: &mut S,
    reason: &str,
) {
    if slot.machine.is_running() {
        let task_id = slot.machine.current_task_id().map(str::to_owned);
        slot.machine.cancel(now_ms);
        slot.machine.finish();
        if let Some(id) = task_id {
            sink.error(Some(&id), reason);
        }
    }
    if let Some(ctl) = wheels_ctl {
        ctl.emergency_stop();
    }
    while let Some(dropped) = slot.queue.pop_front() {
        sink.error(Some(&dropped.task_id), reason);
    }
    slot.last_progress_ms = 0;
}

/// Wheels durations below the stretch floor behave like the device minimum.
fn capped(duration_ms: u32) -> u32 {
    if duration_ms == 0 {
        0
    } else {
        duration_ms.max(MIN_TASK_DURATION_MS)
    }
}
