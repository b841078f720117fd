//! Module Exports
//!
//! Connectivity for the robot: the Wi-Fi link and the WebSocket session it
//! carries, plus the JSON wire protocol spoken over that session.
//!
//! # Modules
//! - `client`: link/session state machines, heartbeat, reconnect backoff
//! - `protocol`: typed inbound/outbound message envelopes
//!
//! The radio and the socket are external collaborators behind [`LinkPort`]
//! and [`SessionPort`]; the state machines here only ever poll them,
//! never block on them.

pub mod client;
pub mod protocol;

use thiserror::Error;

/// Raw radio status as reported by the link hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Connecting,
    Up,
}

/// The Wi-Fi radio. Association runs in the background; the core polls
/// `status` at a bounded interval.
pub trait LinkPort {
    /// Kick off (or restart) association with the configured network.
    fn start_connect(&mut self);

    fn status(&self) -> LinkStatus;

    fn disconnect(&mut self);

    /// Signal strength in dBm, 0 when not associated.
    fn rssi(&self) -> i32;

    /// Local address once associated, for the hello report.
    fn local_ip(&self) -> Option<String>;
}

/// Events drained from the session transport on each poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake finished; the session is live.
    Connected,
    /// The transport closed or errored out.
    Disconnected,
    /// One inbound text frame (a JSON envelope).
    Text(String),
    /// Transport-level pong answering one of our liveness pings.
    Pong(u64),
}

/// Errors surfaced by a [`SessionPort`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Io(String),
}

/// The WebSocket client transport. Handshake and I/O are non-blocking;
/// completion and inbound traffic surface through `poll`.
pub trait SessionPort {
    /// Begin a handshake with the configured host. Must not block.
    fn start_connect(&mut self);

    /// Drain at most one pending event.
    fn poll(&mut self) -> Option<SessionEvent>;

    /// Send one text frame.
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Send a transport-level liveness ping carrying `t`.
    fn send_ping(&mut self, t: u64) -> Result<(), TransportError>;

    /// Tear the connection down (half-open sockets included).
    fn close(&mut self);
}
