//! Speed and direction byte encoding for the Meccano-MAX motor bus.
//!
//! The module understands exactly one speed byte alphabet: the reserved
//! STOP code `0x40` and fourteen contiguous running codes `0x42..=0x4F`
//! ascending with speed. Direction bytes carry the rotation sense in the
//! high nibble (`0x2` clockwise, `0x3` counter-clockwise) and the wheel's
//! bus position in the low nibble. Everything here is a total, pure
//! function of its inputs.

/// Reserved speed byte meaning "stop", valid on the wire at any time.
pub const SPEED_STOP: u8 = 0x40;
/// Lowest running speed code.
pub const SPEED_MIN: u8 = 0x42;
/// Highest running speed code.
pub const SPEED_MAX: u8 = 0x4F;
/// Number of running speed codes (`SPEED_MIN..=SPEED_MAX`).
pub const SPEED_STEPS: u8 = SPEED_MAX - SPEED_MIN + 1;

/// Direction byte for a stopped wheel. All other direction bytes carry a
/// real rotation sense so the motor never floats while a speed is applied.
pub const DIR_STOP: u8 = 0x00;
/// High-nibble base for clockwise rotation.
pub const DIR_CW_BASE: u8 = 0x20;
/// High-nibble base for counter-clockwise rotation.
pub const DIR_CCW_BASE: u8 = 0x30;

/// Commanded magnitudes below this map to STOP.
pub const SPEED_DEADZONE_PCT: i16 = 2;

/// Per-wheel wiring facts: where the wheel sits on the bus and which
/// rotation sense drives the robot forward (left and right motors are
/// mounted mirrored, so their polarities differ).
#[derive(Debug, Clone, Copy)]
pub struct WheelLayout {
    /// Bus position nibble, `0..=15`.
    pub position: u8,
    /// `true` if "robot forward" is counter-clockwise for this wheel.
    pub forward_ccw: bool,
}

impl WheelLayout {
    /// Stock left wheel: slot 4, forward is counter-clockwise.
    pub const LEFT: WheelLayout = WheelLayout {
        position: 4,
        forward_ccw: true,
    };
    /// Stock right wheel: slot 4, forward is clockwise.
    pub const RIGHT: WheelLayout = WheelLayout {
        position: 4,
        forward_ccw: false,
    };

    /// Direction byte for a signed speed percentage on this wheel.
    ///
    /// Speeds inside the deadzone yield [`DIR_STOP`]; anything else always
    /// carries a real rotation sense, even across a zero crossing.
    pub fn dir_for(&self, pct: i16) -> u8 {
        if speed_code(pct) == SPEED_STOP {
            return DIR_STOP;
        }
        dir_code(self.position, self.forward_ccw ^ (pct < 0))
    }
}

/// Map a signed speed percentage (`-100..=100`) to a bus speed byte.
///
/// Magnitudes below [`SPEED_DEADZONE_PCT`] become [`SPEED_STOP`]; otherwise
/// the magnitude is quantized (round to nearest) onto the fourteen running
/// codes, clamping at [`SPEED_MAX`].
pub fn speed_code(pct: i16) -> u8 {
    let mag = pct.unsigned_abs().min(100) as u32;
    if mag < SPEED_DEADZONE_PCT as u32 {
        return SPEED_STOP;
    }
    let step = (mag * (SPEED_STEPS as u32 - 1) + 50) / 100;
    SPEED_MIN + step.min(SPEED_STEPS as u32 - 1) as u8
}

/// Direction byte for a wheel at `position` rotating in the given sense.
pub fn dir_code(position: u8, counter_clockwise: bool) -> u8 {
    let base = if counter_clockwise {
        DIR_CCW_BASE
    } else {
        DIR_CW_BASE
    };
    base | (position & 0x0F)
}

/// Encode one full frame from signed wheel percentages.
pub fn frame_for(left_pct: i16, right_pct: i16, left: &WheelLayout, right: &WheelLayout) -> super::BusFrame {
    super::BusFrame {
        right_dir: right.dir_for(right_pct),
        left_dir: left.dir_for(left_pct),
        right_speed: speed_code(right_pct),
        left_speed: speed_code(left_pct),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_code_deadzone_and_endpoints() {
        assert_eq!(speed_code(0), SPEED_STOP);
        assert_eq!(speed_code(1), SPEED_STOP);
        assert_eq!(speed_code(-1), SPEED_STOP);
        assert_eq!(speed_code(2), SPEED_MIN);
        assert_eq!(speed_code(-2), SPEED_MIN);
        assert_eq!(speed_code(100), SPEED_MAX);
        assert_eq!(speed_code(-100), SPEED_MAX);
        // Inputs past the contract range clamp rather than wrap.
        assert_eq!(speed_code(120), SPEED_MAX);
        assert_eq!(speed_code(-120), SPEED_MAX);
    }

    #[test]
    fn test_speed_code_full_domain() {
        for pct in -100i16..=100 {
            let code = speed_code(pct);
            if pct.abs() < SPEED_DEADZONE_PCT {
                assert_eq!(code, SPEED_STOP, "pct={pct}");
            } else {
                assert!(
                    (SPEED_MIN..=SPEED_MAX).contains(&code),
                    "pct={pct} code={code:#04x}"
                );
                assert_eq!(code, speed_code(-pct), "sign must not affect magnitude");
            }
        }
    }

    #[test]
    fn test_speed_code_monotonic() {
        let mut last = SPEED_STOP;
        for pct in 2i16..=100 {
            let code = speed_code(pct);
            assert!(code >= last.max(SPEED_MIN), "pct={pct}");
            last = code;
        }
    }

    #[test]
    fn test_speed_code_rounding_fixed_points() {
        // Fixed expected outputs, round-to-nearest across 14 steps.
        for (pct, expected) in [
            (2, 0x42),
            (4, 0x43),
            (25, 0x45),
            (50, 0x49),
            (75, 0x4C),
            (96, 0x4E),
            (97, 0x4F),
            (100, 0x4F),
        ] {
            assert_eq!(speed_code(pct), expected, "pct={pct}");
        }
    }

    #[test]
    fn test_dir_code_nibbles() {
        for pos in 0u8..=15 {
            let cw = dir_code(pos, false);
            let ccw = dir_code(pos, true);
            assert_ne!(cw, ccw);
            assert_eq!(cw & 0x0F, pos & 0x0F);
            assert_eq!(ccw & 0x0F, pos & 0x0F);
            assert_eq!(cw & 0xF0, DIR_CW_BASE);
            assert_eq!(ccw & 0xF0, DIR_CCW_BASE);
        }
    }

    #[test]
    fn test_stock_layout_matches_hardware() {
        // Observed on the stock MAX: robot forward is left 0x34, right 0x24.
        assert_eq!(WheelLayout::LEFT.dir_for(50), 0x34);
        assert_eq!(WheelLayout::RIGHT.dir_for(50), 0x24);
        assert_eq!(WheelLayout::LEFT.dir_for(-50), 0x24);
        assert_eq!(WheelLayout::RIGHT.dir_for(-50), 0x34);
        // Deadzone speeds never carry a direction.
        assert_eq!(WheelLayout::LEFT.dir_for(0), DIR_STOP);
        assert_eq!(WheelLayout::RIGHT.dir_for(1), DIR_STOP);
    }

    #[test]
    fn test_frame_for_wire_order() {
        let frame = frame_for(50, -50, &WheelLayout::LEFT, &WheelLayout::RIGHT);
        assert_eq!(
            frame.to_bytes(),
            [0x34, 0x34, speed_code(50), speed_code(50)]
        );
        let stop = frame_for(0, 0, &WheelLayout::LEFT, &WheelLayout::RIGHT);
        assert_eq!(stop, crate::utils::bus::BusFrame::STOP);
    }
}
