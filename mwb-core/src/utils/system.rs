//! Top-level control loop: one [`SystemController`] owns connectivity,
//! dispatch, and the wheels controller, and advances them in a fixed order
//! every tick.
//!
//! Tick order matters for safety: connectivity is pumped first so a session
//! loss fails everything safe before any actuator moves, then commands are
//! routed, then the dispatcher and wheels advance, and telemetry samples
//! last so it observes the settled state.

use tracing::warn;

use crate::utils::bus::BusPort;
use crate::utils::connection::client::ConnectivityManager;
use crate::utils::connection::protocol::{self, Inbound};
use crate::utils::connection::{LinkPort, SessionPort};
use crate::utils::controllers::{Actuator, TaskEnvelope, WheelsController};
use crate::utils::dispatch::{ReportSink, TaskDispatcher};

/// How often a telemetry snapshot is taken.
pub const TELEMETRY_INTERVAL_MS: u64 = 1000;

/// One periodic sample of system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub session_up: bool,
    pub bus_detected: bool,
    pub wheels_current: (i16, i16),
    pub wheels_target: (i16, i16),
    pub queue_depths: [usize; 3],
}

/// Telemetry consumer. The host binary logs snapshots; `()` discards them.
pub trait Telemetry {
    fn record(&mut self, snapshot: &Snapshot);
}

impl Telemetry for () {
    fn record(&mut self, _snapshot: &Snapshot) {}
}

/// The whole robot, minus the hardware behind the ports.
pub struct SystemController<P, L, S, T>
where
    P: BusPort,
    L: LinkPort,
    S: SessionPort,
    T: Telemetry,
{
    conn: ConnectivityManager<L, S>,
    dispatcher: TaskDispatcher,
    wheels: WheelsController<P>,
    telemetry: T,
    last_snapshot_ms: u64,
}

impl<P, L, S, T> SystemController<P, L, S, T>
where
    P: BusPort,
    L: LinkPort,
    S: SessionPort,
    T: Telemetry,
{
    pub fn new(
        conn: ConnectivityManager<L, S>,
        wheels: WheelsController<P>,
        telemetry: T,
    ) -> Self {
        SystemController {
            conn,
            dispatcher: TaskDispatcher::new(),
            wheels,
            telemetry,
            last_snapshot_ms: 0,
        }
    }

    /// One-time startup: probe the motor bus.
    pub fn begin(&mut self, now_ms: u64) {
        self.wheels.begin(now_ms);
    }

    /// One full control tick. Call at a steady cadence (tens of ms).
    pub fn tick(&mut self, now_ms: u64) {
        let pump = self.conn.pump(now_ms);

        if pump.session_lost {
            // Anything drained alongside the loss came from a dead operator;
            // routing it would re-energize actuators right after the stop.
            self.dispatcher
                .cancel_all("connection lost", now_ms, &mut self.wheels, &mut self.conn);
        } else {
            for command in pump.commands {
                self.route(command, now_ms);
            }
        }

        self.dispatcher.tick(now_ms, &mut self.wheels, &mut self.conn);
        self.wheels.tick(now_ms);

        if now_ms.saturating_sub(self.last_snapshot_ms) >= TELEMETRY_INTERVAL_MS {
            self.last_snapshot_ms = now_ms;
            let snapshot = self.snapshot();
            self.telemetry.record(&snapshot);
        }
    }

    fn route(&mut self, command: Inbound, now_ms: u64) {
        match command {
            Inbound::Drive {
                left,
                right,
                duration_ms,
            } => match protocol::validate_drive(left, right, duration_ms) {
                Ok((left, right, duration_ms)) => {
                    self.dispatcher.set_pending_drive(left, right, duration_ms);
                }
                Err(err) => {
                    warn!(%err, "rejecting drive command");
                    self.conn.error(None, &err.to_string());
                }
            },
            Inbound::TaskReplace { tasks } => {
                let valid = self.validate_batch(&tasks);
                self.dispatcher
                    .replace_tasks(&valid, now_ms, &mut self.wheels, &mut self.conn);
            }
            Inbound::TaskEnqueue { tasks } => {
                let valid = self.validate_batch(&tasks);
                self.dispatcher
                    .enqueue_tasks(&valid, now_ms, &mut self.wheels, &mut self.conn);
            }
            Inbound::TaskCancel { device } => {
                self.dispatcher
                    .cancel_device(device, now_ms, &mut self.wheels, &mut self.conn);
            }
            // Handled inside the connectivity layer.
            Inbound::Hello | Inbound::Ping { .. } => {}
        }
    }

    /// Per-task validation: bad tasks are reported and dropped, the rest of
    /// the batch goes through.
    fn validate_batch(&mut self, tasks: &[TaskEnvelope]) -> Vec<TaskEnvelope> {
        let mut valid = Vec::with_capacity(tasks.len());
        for task in tasks {
            match protocol::validate_task(task) {
                Ok(sanitized) => valid.push(sanitized),
                Err(err) => {
                    warn!(task_id = %task.task_id, %err, "rejecting task");
                    let id = if task.task_id.is_empty() {
                        None
                    } else {
                        Some(task.task_id.as_str())
                    };
                    self.conn.error(id, &err.to_string());
                }
            }
        }
        valid
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session_up: self.conn.is_session_connected(),
            bus_detected: self.wheels.bus_detected(),
            wheels_current: self.wheels.current_pct(),
            wheels_target: self.wheels.target_pct(),
            queue_depths: [
                self.dispatcher.queue_len(Actuator::Wheels),
                self.dispatcher.queue_len(Actuator::Arm),
                self.dispatcher.queue_len(Actuator::Neck),
            ],
        }
    }

    pub fn connectivity(&self) -> &ConnectivityManager<L, S> {
        &self.conn
    }

    pub fn wheels(&self) -> &WheelsController<P> {
        &self.wheels
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }
}
