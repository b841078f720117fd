//! Control core for the Max Wheel Bot: a Wi-Fi connected wheeled robot driven
//! over the Meccano-MAX single-wire motor bus.
//!
//! For a runnable host harness, see the `host-sim` binary in `mwb-app/`.

pub mod utils;
