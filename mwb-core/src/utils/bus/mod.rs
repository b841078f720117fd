//! Motor bus types for the Meccano-MAX single-wire protocol.
//!
//! # Modules
//! - `codec`: pure speed/direction byte encoding
//!
//! The bus itself is an external collaborator reached through [`BusPort`];
//! the core only decides *what* 4-byte frame to put on the wire and when.

pub mod codec;

use thiserror::Error;

/// One 4-byte command frame written to the motor bus.
///
/// Wiring contract: the right channel comes first on this bus, so the byte
/// order is `{right_dir, left_dir, right_speed, left_speed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusFrame {
    pub right_dir: u8,
    pub left_dir: u8,
    pub right_speed: u8,
    pub left_speed: u8,
}

impl BusFrame {
    /// The all-stop frame: reserved STOP speed and zero direction for both wheels.
    pub const STOP: BusFrame = BusFrame {
        right_dir: codec::DIR_STOP,
        left_dir: codec::DIR_STOP,
        right_speed: codec::SPEED_STOP,
        left_speed: codec::SPEED_STOP,
    };

    /// Raw wire order, right channel first.
    pub fn to_bytes(self) -> [u8; 4] {
        [
            self.right_dir,
            self.left_dir,
            self.right_speed,
            self.left_speed,
        ]
    }
}

/// Errors surfaced by a [`BusPort`] implementation.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("motor bus write failed")]
    WriteFailed,
    #[error("motor module not detected on the bus")]
    NotDetected,
}

/// Collaborator owning the physical single-wire bus.
///
/// Frames are idempotent; a failed write is simply retried on the next
/// control tick, so implementations should not buffer or retry internally.
pub trait BusPort {
    /// Poll for the attached motor module. Returns `true` once the module
    /// answers discovery. Must be non-blocking.
    fn probe(&mut self) -> bool;

    /// Write one frame to the bus.
    fn write_frame(&mut self, frame: &BusFrame) -> Result<(), BusError>;
}
