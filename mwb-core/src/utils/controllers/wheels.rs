//! Drive wheel motion control.
//!
//! [`WheelsController`] owns the commanded and actual speed of both drive
//! wheels and is the only writer of the motor bus. Every control tick it
//! applies, in order: command deadline, soft-stop and hard-stop timeouts,
//! slew-rate limiting, and the bus write decision (change detection plus
//! keep-alive refresh; the MAX motor module goes idle if it stops hearing
//! frames).
//!
//! Nothing in here can fail the control loop: bus errors are counted and
//! retried on the next tick because frames are idempotent.

use tracing::{debug, info, warn};

use crate::utils::bus::{codec, codec::WheelLayout, BusFrame, BusPort};

/// Tuning for the wheels control loop. Defaults match the stock robot.
#[derive(Debug, Clone)]
pub struct WheelsConfig {
    /// Maximum commanded-speed change, percent per second.
    pub slew_pct_per_s: u32,
    /// No command for this long: decay targets to zero (still slew-limited).
    pub soft_stop_ms: u32,
    /// No command for this long: emergency stop, bypassing slew.
    pub hard_stop_ms: u32,
    /// Re-send the last frame if the bus has been quiet this long.
    pub keep_alive_ms: u32,
    /// Retry interval for motor module discovery.
    pub probe_retry_ms: u32,
    /// Consecutive bus write failures before a health warning is logged.
    pub bus_error_warn_threshold: u32,
    pub left: WheelLayout,
    pub right: WheelLayout,
}

impl Default for WheelsConfig {
    fn default() -> Self {
        WheelsConfig {
            slew_pct_per_s: 250,
            soft_stop_ms: 300,
            hard_stop_ms: 1000,
            keep_alive_ms: 100,
            probe_retry_ms: 1000,
            bus_error_warn_threshold: 10,
            left: WheelLayout::LEFT,
            right: WheelLayout::RIGHT,
        }
    }
}

/// Slew-limited controller for the two drive wheels.
///
/// Internally speeds are tracked in milli-percent so the per-tick slew step
/// keeps its sub-percent remainder instead of drifting over long ramps.
pub struct WheelsController<P: BusPort> {
    config: WheelsConfig,
    port: P,
    detected: bool,
    last_probe_ms: u64,

    target_mpct_l: i32,
    target_mpct_r: i32,
    current_mpct_l: i32,
    current_mpct_r: i32,

    last_sent: Option<BusFrame>,
    last_command_ms: u64,
    last_bus_write_ms: u64,
    last_tick_ms: u64,
    /// 0 = no deadline.
    deadline_ms: u64,
    hard_stopped: bool,
    consecutive_bus_errors: u32,
}

impl<P: BusPort> WheelsController<P> {
    pub fn new(port: P, config: WheelsConfig) -> Self {
        WheelsController {
            config,
            port,
            detected: false,
            last_probe_ms: 0,
            target_mpct_l: 0,
            target_mpct_r: 0,
            current_mpct_l: 0,
            current_mpct_r: 0,
            last_sent: None,
            last_command_ms: 0,
            last_bus_write_ms: 0,
            last_tick_ms: 0,
            deadline_ms: 0,
            hard_stopped: true,
            consecutive_bus_errors: 0,
        }
    }

    /// Start bus discovery and park the motors. Non-blocking: if the motor
    /// module is not answering yet, `tick` keeps probing at a bounded rate.
    pub fn begin(&mut self, now_ms: u64) {
        self.last_probe_ms = now_ms;
        self.detected = self.port.probe();
        if self.detected {
            info!("motor module detected");
        } else {
            info!("motor module not detected yet, will keep probing");
        }
        self.emergency_stop();
        self.last_tick_ms = now_ms;
        self.last_command_ms = now_ms;
    }

    /// Record a new drive command. Inputs are clamped to `-100..=100`;
    /// `duration_ms > 0` arms a deadline after which both targets drop to zero.
    pub fn set_target(&mut self, left_pct: i16, right_pct: i16, duration_ms: u32, now_ms: u64) {
        self.target_mpct_l = i32::from(left_pct.clamp(-100, 100)) * 1000;
        self.target_mpct_r = i32::from(right_pct.clamp(-100, 100)) * 1000;
        self.last_command_ms = now_ms;
        self.deadline_ms = if duration_ms > 0 {
            now_ms + u64::from(duration_ms)
        } else {
            0
        };
        self.hard_stopped = false;
        debug!(
            left = left_pct,
            right = right_pct,
            duration_ms,
            "wheels target set"
        );
    }

    /// One control tick. Never fails; bus errors are absorbed and retried.
    pub fn tick(&mut self, now_ms: u64) {
        let dt_ms = now_ms.saturating_sub(self.last_tick_ms);
        self.last_tick_ms = now_ms;

        if !self.detected {
            if now_ms.saturating_sub(self.last_probe_ms) >= u64::from(self.config.probe_retry_ms) {
                self.last_probe_ms = now_ms;
                self.detected = self.port.probe();
                if self.detected {
                    info!("motor module detected");
                }
            }
            if !self.detected {
                return;
            }
        }

        // 1. Command deadline.
        if self.deadline_ms != 0 && now_ms >= self.deadline_ms {
            self.target_mpct_l = 0;
            self.target_mpct_r = 0;
            self.deadline_ms = 0;
            debug!("drive deadline reached, targets zeroed");
        }

        let silence_ms = now_ms.saturating_sub(self.last_command_ms);

        // 2. Hard stop wins over everything, including slew.
        if silence_ms >= u64::from(self.config.hard_stop_ms) {
            if !self.hard_stopped {
                warn!(silence_ms, "hard-stop timeout, stopping immediately");
            }
            self.emergency_stop();
            return;
        }

        // 3. Soft stop: let the slew ramp the wheels down.
        if silence_ms >= u64::from(self.config.soft_stop_ms)
            && (self.target_mpct_l != 0 || self.target_mpct_r != 0)
        {
            self.target_mpct_l = 0;
            self.target_mpct_r = 0;
            debug!(silence_ms, "soft-stop timeout, targets zeroed");
        }

        // 4. Slew: pct/s times ms gives milli-percent with no lost remainder.
        let max_delta = (self.config.slew_pct_per_s as i64 * dt_ms as i64)
            .min(i32::MAX as i64) as i32;
        self.current_mpct_l = slew_toward(self.current_mpct_l, self.target_mpct_l, max_delta);
        self.current_mpct_r = slew_toward(self.current_mpct_r, self.target_mpct_r, max_delta);

        // 5/6. Write only on change or keep-alive expiry.
        let frame = codec::frame_for(
            (self.current_mpct_l / 1000) as i16,
            (self.current_mpct_r / 1000) as i16,
            &self.config.left,
            &self.config.right,
        );
        let changed = self.last_sent != Some(frame);
        let stale =
            now_ms.saturating_sub(self.last_bus_write_ms) >= u64::from(self.config.keep_alive_ms);
        if changed || stale {
            self.write_frame(frame, now_ms);
        }
    }

    /// Zero all motion state and put a STOP frame on the bus right away,
    /// bypassing slew and change detection. Safe to call at any time,
    /// including before `begin`.
    pub fn emergency_stop(&mut self) {
        self.target_mpct_l = 0;
        self.target_mpct_r = 0;
        self.current_mpct_l = 0;
        self.current_mpct_r = 0;
        self.deadline_ms = 0;
        self.hard_stopped = true;
        if self.detected {
            self.write_frame(BusFrame::STOP, self.last_tick_ms);
        } else {
            self.last_sent = Some(BusFrame::STOP);
        }
    }

    /// Current slew-limited output, percent. Exposed for progress and tests.
    pub fn current_pct(&self) -> (i16, i16) {
        (
            (self.current_mpct_l / 1000) as i16,
            (self.current_mpct_r / 1000) as i16,
        )
    }

    /// Commanded targets, percent.
    pub fn target_pct(&self) -> (i16, i16) {
        (
            (self.target_mpct_l / 1000) as i16,
            (self.target_mpct_r / 1000) as i16,
        )
    }

    /// Last frame accepted by the bus, if any.
    pub fn last_sent_frame(&self) -> Option<BusFrame> {
        self.last_sent
    }

    pub fn bus_detected(&self) -> bool {
        self.detected
    }

    fn write_frame(&mut self, frame: BusFrame, now_ms: u64) {
        match self.port.write_frame(&frame) {
            Ok(()) => {
                self.consecutive_bus_errors = 0;
                self.last_sent = Some(frame);
                self.last_bus_write_ms = now_ms;
            }
            Err(err) => {
                self.consecutive_bus_errors += 1;
                if self.consecutive_bus_errors == self.config.bus_error_warn_threshold {
                    warn!(
                        failures = self.consecutive_bus_errors,
                        %err,
                        "motor bus unhealthy"
                    );
                } else {
                    debug!(%err, "bus write failed, retrying next tick");
                }
            }
        }
    }
}

/// Move `current` toward `target` by at most `max_delta` (all milli-percent).
fn slew_toward(current: i32, target: i32, max_delta: i32) -> i32 {
    let diff = target - current;
    current + diff.clamp(-max_delta, max_delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bus::BusError;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Bus double recording every frame; optionally failing writes.
    struct RecordingBus {
        frames: Rc<RefCell<Vec<BusFrame>>>,
        fail: bool,
        present: bool,
    }

    impl RecordingBus {
        fn new() -> (Self, Rc<RefCell<Vec<BusFrame>>>) {
            let frames = Rc::new(RefCell::new(Vec::new()));
            (
                RecordingBus {
                    frames: frames.clone(),
                    fail: false,
                    present: true,
                },
                frames,
            )
        }
    }

    impl BusPort for RecordingBus {
        fn probe(&mut self) -> bool {
            self.present
        }

        fn write_frame(&mut self, frame: &BusFrame) -> Result<(), BusError> {
            if self.fail {
                return Err(BusError::WriteFailed);
            }
            self.frames.borrow_mut().push(*frame);
            Ok(())
        }
    }

    const TICK: u64 = 33;

    fn controller() -> (WheelsController<RecordingBus>, Rc<RefCell<Vec<BusFrame>>>) {
        let (bus, frames) = RecordingBus::new();
        let mut ctl = WheelsController::new(bus, WheelsConfig::default());
        ctl.begin(0);
        (ctl, frames)
    }

    #[test]
    fn test_slew_bounded_per_tick() {
        let (mut ctl, _frames) = controller();
        ctl.set_target(100, 100, 0, 0);
        let max_step = (250 * TICK as i32 / 1000) as i16 + 1;
        let mut now = 0;
        let mut prev = ctl.current_pct().0;
        for _ in 0..60 {
            now += TICK;
            ctl.tick(now);
            // keep commands fresh so the soft stop stays out of the way
            ctl.set_target(100, 100, 0, now);
            let cur = ctl.current_pct().0;
            assert!(
                (cur - prev).abs() <= max_step,
                "step {} exceeds slew bound",
                cur - prev
            );
            prev = cur;
        }
        assert_eq!(ctl.current_pct(), (100, 100));
    }

    #[test]
    fn test_soft_stop_decays_via_slew() {
        let (mut ctl, _frames) = controller();
        ctl.set_target(50, 50, 0, 0);
        let mut now = 0;
        while ctl.current_pct().0 < 50 {
            now += TICK;
            ctl.tick(now);
            ctl.set_target(50, 50, 0, now);
        }
        // Go silent past the soft-stop window but short of the hard stop.
        let silent_from = now;
        while now - silent_from < 301 {
            now += TICK;
            ctl.tick(now);
        }
        assert_eq!(ctl.target_pct(), (0, 0));
        // Decay is gradual, not instantaneous.
        assert!(ctl.current_pct().0 > 0);
        while now - silent_from < 900 {
            now += TICK;
            ctl.tick(now);
        }
        assert_eq!(ctl.current_pct(), (0, 0));
    }

    #[test]
    fn test_hard_stop_bypasses_slew() {
        let (mut ctl, frames) = controller();
        ctl.set_target(80, 80, 0, 0);
        let mut now = 0;
        for _ in 0..10 {
            now += TICK;
            ctl.tick(now);
        }
        assert!(ctl.current_pct().0 > 0);
        now = 1001;
        ctl.tick(now);
        assert_eq!(ctl.current_pct(), (0, 0));
        assert_eq!(ctl.target_pct(), (0, 0));
        assert_eq!(*frames.borrow().last().unwrap(), BusFrame::STOP);
    }

    #[test]
    fn test_deadline_zeroes_targets() {
        let (mut ctl, _frames) = controller();
        ctl.set_target(60, -60, 200, 0);
        ctl.tick(TICK);
        assert_eq!(ctl.target_pct(), (60, -60));
        ctl.tick(201);
        assert_eq!(ctl.target_pct(), (0, 0));
    }

    #[test]
    fn test_keep_alive_refreshes_quiet_bus() {
        let (mut ctl, frames) = controller();
        let mut now = 0;
        // Fully ramped and holding: frames must still flow at keep-alive rate.
        ctl.set_target(50, 50, 0, now);
        for _ in 0..40 {
            now += TICK;
            ctl.tick(now);
            ctl.set_target(50, 50, 0, now);
        }
        let settled = frames.borrow().len();
        for _ in 0..10 {
            now += TICK;
            ctl.tick(now);
            ctl.set_target(50, 50, 0, now);
        }
        let after = frames.borrow().len();
        // 10 ticks at 33ms with a 100ms keep-alive: at least 3 refreshes.
        assert!(after - settled >= 3, "only {} refreshes", after - settled);
        // And no change-triggered writes in between: consecutive frames equal.
        let all = frames.borrow();
        assert_eq!(all[settled..].iter().collect::<std::collections::HashSet<_>>().len(), 1);
    }

    #[test]
    fn test_emergency_stop_before_begin() {
        let (bus, frames) = RecordingBus::new();
        let mut ctl = WheelsController::new(bus, WheelsConfig::default());
        ctl.emergency_stop();
        assert_eq!(ctl.current_pct(), (0, 0));
        assert!(frames.borrow().is_empty());
    }

    #[test]
    fn test_bus_failures_are_absorbed() {
        let (mut bus, frames) = RecordingBus::new();
        bus.fail = true;
        let mut ctl = WheelsController::new(bus, WheelsConfig::default());
        ctl.begin(0);
        let mut now = 0;
        ctl.set_target(40, 40, 0, 0);
        for _ in 0..20 {
            now += TICK;
            ctl.tick(now);
            ctl.set_target(40, 40, 0, now);
        }
        assert!(frames.borrow().is_empty());
        // Still ramping internal state; loop never died.
        assert!(ctl.current_pct().0 > 0);
    }

    #[test]
    fn test_undetected_bus_keeps_probing() {
        let (mut bus, frames) = RecordingBus::new();
        bus.present = false;
        let mut ctl = WheelsController::new(bus, WheelsConfig::default());
        ctl.begin(0);
        assert!(!ctl.bus_detected());
        ctl.set_target(50, 50, 0, 0);
        ctl.tick(TICK);
        assert!(frames.borrow().is_empty());
        // Probe retry window elapses; module still absent, no frames, no panic.
        ctl.tick(1000);
        assert!(!ctl.bus_detected());
    }
}
