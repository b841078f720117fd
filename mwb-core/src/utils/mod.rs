//! Utility re-exports for the Max Wheel Bot control core.
//!
//! This module groups the firmware subsystems and re-exports the types most
//! callers need:
//!
//! - `bus`: Meccano-MAX frame encoding and the motor bus port trait
//! - `controllers`: wheel motion control and per-actuator task lifecycles
//! - `dispatch`: task queues, batch acceptance, and status reporting
//! - `connection`: Wi-Fi link and WebSocket session state machines
//! - `system`: the single-threaded control loop tying everything together
//!
//! All timing in the core is driven by an injected `now_ms` wall-clock value;
//! nothing below `system` ever reads a clock on its own.

pub mod bus;
pub mod connection;
pub mod controllers;
pub mod dispatch;
pub mod system;

pub use connection::client::ConnectivityManager;
pub use controllers::wheels::WheelsController;
pub use dispatch::TaskDispatcher;
pub use system::SystemController;
