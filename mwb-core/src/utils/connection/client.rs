//! Connectivity management: Wi-Fi association and the WebSocket session
//! layered on top of it.
//!
//! Two nested state machines run here. The link machine mirrors the radio
//! (Disconnected/Connecting/Connected/Reconnecting, capped exponential
//! backoff). The session machine owns the WebSocket handshake, a
//! transport-level heartbeat that catches half-open sockets, and reconnect
//! backoff with jitter so a fleet of robots does not stampede the server.
//!
//! Losing the session is a safety event: the caller gets `session_lost`
//! exactly once per loss and must fail-safe every actuator.

use tracing::{debug, info, warn};

use super::protocol::{self, Inbound, Outbound};
use super::{LinkPort, LinkStatus, SessionEvent, SessionPort};
use crate::utils::dispatch::ReportSink;

/// Wi-Fi supervision tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How often the radio status is polled.
    pub check_interval_ms: u32,
    /// Give up on an association attempt after this long.
    pub connect_timeout_ms: u32,
    pub backoff_base_ms: u32,
    pub backoff_max_ms: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            check_interval_ms: 500,
            connect_timeout_ms: 8000,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

/// WebSocket session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect_base_ms: u32,
    pub reconnect_max_ms: u32,
    /// Handshake timeout; a stuck `Connecting` counts as a failure.
    pub connect_timeout_ms: u32,
    pub heartbeat_interval_ms: u32,
    pub heartbeat_timeout_ms: u32,
    /// Consecutive missed pongs before the session is declared dead.
    pub heartbeat_tries: u32,
    /// Outbound progress telemetry budget per second; overflow is dropped.
    pub progress_per_s: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            reconnect_base_ms: 1000,
            reconnect_max_ms: 10_000,
            connect_timeout_ms: 8000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 3000,
            heartbeat_tries: 3,
            progress_per_s: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What one connectivity pump produced: parsed operator commands, plus a
/// flag raised on the tick the session died (close, error, or heartbeat).
#[derive(Debug, Default)]
pub struct PumpResult {
    pub commands: Vec<Inbound>,
    pub session_lost: bool,
}

/// Composes the link and session state machines over their ports.
pub struct ConnectivityManager<L: LinkPort, S: SessionPort> {
    link: L,
    session: S,
    link_cfg: LinkConfig,
    session_cfg: SessionConfig,
    identity: String,
    fw: String,

    link_state: LinkState,
    link_attempts: u32,
    link_last_check_ms: u64,
    link_attempt_started_ms: u64,

    session_state: SessionState,
    session_attempts: u32,
    session_attempt_started_ms: u64,
    next_session_attempt_ms: u64,

    last_ping_ms: u64,
    awaiting_pong_since: Option<u64>,
    heartbeat_misses: u32,

    seq: u32,
    rate_window_start_ms: u64,
    rate_count: u32,
    progress_dropped: u32,
    now_ms: u64,
    rng: fastrand::Rng,
}

impl<L: LinkPort, S: SessionPort> ConnectivityManager<L, S> {
    pub fn new(link: L, session: S, identity: impl Into<String>) -> Self {
        Self::with_seed(link, session, identity, fastrand::u64(..))
    }

    /// Deterministic construction for tests: the seed fixes backoff jitter.
    pub fn with_seed(link: L, session: S, identity: impl Into<String>, seed: u64) -> Self {
        ConnectivityManager {
            link,
            session,
            link_cfg: LinkConfig::default(),
            session_cfg: SessionConfig::default(),
            identity: identity.into(),
            fw: concat!("mwb-core/", env!("CARGO_PKG_VERSION")).to_owned(),
            link_state: LinkState::Disconnected,
            link_attempts: 0,
            link_last_check_ms: 0,
            link_attempt_started_ms: 0,
            session_state: SessionState::Disconnected,
            session_attempts: 0,
            session_attempt_started_ms: 0,
            next_session_attempt_ms: 0,
            last_ping_ms: 0,
            awaiting_pong_since: None,
            heartbeat_misses: 0,
            seq: 0,
            rate_window_start_ms: 0,
            rate_count: 0,
            progress_dropped: 0,
            now_ms: 0,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    pub fn with_configs(mut self, link_cfg: LinkConfig, session_cfg: SessionConfig) -> Self {
        self.link_cfg = link_cfg;
        self.session_cfg = session_cfg;
        self
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn is_session_connected(&self) -> bool {
        self.session_state == SessionState::Connected
    }

    /// Progress reports dropped by the rate limiter since boot.
    pub fn progress_dropped(&self) -> u32 {
        self.progress_dropped
    }

    /// One connectivity pump: advance both state machines, run the
    /// heartbeat, and drain inbound traffic. Bounded work; never blocks.
    pub fn pump(&mut self, now_ms: u64) -> PumpResult {
        self.now_ms = now_ms;
        let mut result = PumpResult::default();
        self.tick_link(now_ms);
        self.tick_session(now_ms, &mut result);
        self.drain_events(now_ms, &mut result);
        result
    }

    fn tick_link(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.link_last_check_ms)
            < u64::from(self.link_cfg.check_interval_ms)
            && self.link_state != LinkState::Disconnected
        {
            return;
        }
        self.link_last_check_ms = now_ms;

        let status = self.link.status();
        match self.link_state {
            LinkState::Disconnected => {
                info!("starting wifi association");
                self.link.start_connect();
                self.link_attempt_started_ms = now_ms;
                if self.link.status() == LinkStatus::Up {
                    self.link_up();
                } else {
                    self.link_state = LinkState::Connecting;
                }
            }
            LinkState::Connecting => match status {
                LinkStatus::Up => self.link_up(),
                _ if now_ms.saturating_sub(self.link_attempt_started_ms)
                    >= u64::from(self.link_cfg.connect_timeout_ms) =>
                {
                    warn!(attempts = self.link_attempts, "wifi association timed out");
                    self.link_attempts += 1;
                    self.link_state = LinkState::Reconnecting;
                }
                _ => {}
            },
            LinkState::Connected => {
                if status != LinkStatus::Up {
                    warn!("wifi link lost");
                    self.link_state = LinkState::Reconnecting;
                    self.link_attempts = 0;
                    self.link.start_connect();
                    self.link_attempt_started_ms = now_ms;
                }
            }
            LinkState::Reconnecting => {
                if status == LinkStatus::Up {
                    self.link_up();
                } else if now_ms.saturating_sub(self.link_attempt_started_ms)
                    >= backoff_delay(
                        u64::from(self.link_cfg.backoff_base_ms),
                        u64::from(self.link_cfg.backoff_max_ms),
                        self.link_attempts,
                        1.0,
                    )
                {
                    self.link_attempts += 1;
                    debug!(attempt = self.link_attempts, "retrying wifi association");
                    self.link.start_connect();
                    self.link_attempt_started_ms = now_ms;
                }
            }
        }
    }

    fn link_up(&mut self) {
        self.link_state = LinkState::Connected;
        self.link_attempts = 0;
        info!(
            rssi = self.link.rssi(),
            ip = self.link.local_ip().as_deref().unwrap_or("-"),
            "wifi associated"
        );
    }

    fn tick_session(&mut self, now_ms: u64, result: &mut PumpResult) {
        if self.link_state != LinkState::Connected {
            // No radio, no session. Tear down whatever was in flight.
            if self.session_state != SessionState::Disconnected {
                let was_connected = self.session_state == SessionState::Connected;
                self.session.close();
                self.schedule_reconnect(now_ms);
                if was_connected {
                    result.session_lost = true;
                }
            }
            return;
        }

        match self.session_state {
            SessionState::Disconnected => {
                if now_ms >= self.next_session_attempt_ms {
                    info!("opening websocket session");
                    self.session.start_connect();
                    self.session_state = SessionState::Connecting;
                    self.session_attempt_started_ms = now_ms;
                }
            }
            SessionState::Connecting => {
                if now_ms.saturating_sub(self.session_attempt_started_ms)
                    >= u64::from(self.session_cfg.connect_timeout_ms)
                {
                    warn!("websocket handshake timed out");
                    self.session.close();
                    self.schedule_reconnect(now_ms);
                }
            }
            SessionState::Connected => self.tick_heartbeat(now_ms, result),
        }
    }

    fn tick_heartbeat(&mut self, now_ms: u64, result: &mut PumpResult) {
        if let Some(sent_ms) = self.awaiting_pong_since {
            if now_ms.saturating_sub(sent_ms) >= u64::from(self.session_cfg.heartbeat_timeout_ms) {
                self.awaiting_pong_since = None;
                self.heartbeat_misses += 1;
                warn!(
                    misses = self.heartbeat_misses,
                    limit = self.session_cfg.heartbeat_tries,
                    "heartbeat pong missed"
                );
                if self.heartbeat_misses >= self.session_cfg.heartbeat_tries {
                    warn!("heartbeat failed, declaring session dead");
                    self.session.close();
                    self.schedule_reconnect(now_ms);
                    result.session_lost = true;
                }
            }
        } else if now_ms.saturating_sub(self.last_ping_ms)
            >= u64::from(self.session_cfg.heartbeat_interval_ms)
        {
            match self.session.send_ping(now_ms) {
                Ok(()) => {
                    self.last_ping_ms = now_ms;
                    self.awaiting_pong_since = Some(now_ms);
                }
                Err(err) => {
                    warn!(%err, "heartbeat ping failed to send");
                    self.session.close();
                    self.schedule_reconnect(now_ms);
                    result.session_lost = true;
                }
            }
        }
    }

    fn drain_events(&mut self, now_ms: u64, result: &mut PumpResult) {
        while let Some(event) = self.session.poll() {
            match event {
                SessionEvent::Connected => {
                    info!("websocket session established");
                    self.session_state = SessionState::Connected;
                    self.session_attempts = 0;
                    self.heartbeat_misses = 0;
                    self.awaiting_pong_since = None;
                    self.last_ping_ms = now_ms;
                    self.send_hello();
                }
                SessionEvent::Disconnected => {
                    let was_connected = self.session_state == SessionState::Connected;
                    warn!("websocket session closed");
                    self.session.close();
                    self.schedule_reconnect(now_ms);
                    if was_connected {
                        result.session_lost = true;
                    }
                }
                SessionEvent::Pong(_) => {
                    self.awaiting_pong_since = None;
                    self.heartbeat_misses = 0;
                }
                SessionEvent::Text(text) => match protocol::parse_inbound(&text) {
                    Ok(Inbound::Ping { t }) => self.send(&Outbound::Pong { t }),
                    Ok(Inbound::Hello) => debug!("operator hello received"),
                    Ok(command) => result.commands.push(command),
                    Err(err) => {
                        warn!(%err, "rejecting inbound message");
                        self.error(None, &err.to_string());
                    }
                },
            }
        }
    }

    fn schedule_reconnect(&mut self, now_ms: u64) {
        self.session_state = SessionState::Disconnected;
        self.awaiting_pong_since = None;
        self.heartbeat_misses = 0;
        let jitter = 0.8 + 0.4 * self.rng.f32();
        let delay = backoff_delay(
            u64::from(self.session_cfg.reconnect_base_ms),
            u64::from(self.session_cfg.reconnect_max_ms),
            self.session_attempts,
            jitter,
        );
        self.session_attempts += 1;
        self.next_session_attempt_ms = now_ms + delay;
        info!(delay_ms = delay, "websocket reconnect scheduled");
    }

    fn send_hello(&mut self) {
        let hello = Outbound::Hello {
            id: self.identity.clone(),
            fw: self.fw.clone(),
            rssi: self.link.rssi(),
            ip: self.link.local_ip().unwrap_or_else(|| "0.0.0.0".into()),
        };
        self.send(&hello);
    }

    /// Serialize and send one outbound envelope. Quietly a no-op while the
    /// session is down; transport failures surface through the heartbeat.
    fn send(&mut self, msg: &Outbound) {
        if self.session_state != SessionState::Connected {
            return;
        }
        match protocol::encode_outbound(msg) {
            Ok(text) => {
                if let Err(err) = self.session.send_text(&text) {
                    warn!(%err, "outbound send failed");
                }
            }
            Err(err) => warn!(%err, "outbound encode failed"),
        }
    }

    /// Progress telemetry budget: a fixed number of sends per one-second
    /// window, overflow dropped (never queued).
    fn telemetry_allowance(&mut self) -> bool {
        if self.now_ms.saturating_sub(self.rate_window_start_ms) >= 1000 {
            self.rate_window_start_ms = self.now_ms;
            self.rate_count = 0;
        }
        if self.rate_count < self.session_cfg.progress_per_s {
            self.rate_count += 1;
            true
        } else {
            self.progress_dropped += 1;
            false
        }
    }
}

impl<L: LinkPort, S: SessionPort> ReportSink for ConnectivityManager<L, S> {
    fn ack(&mut self, task_id: &str) {
        self.seq = self.seq.wrapping_add(1);
        let msg = Outbound::Ack {
            task_id: task_id.to_owned(),
            seq: self.seq,
        };
        self.send(&msg);
    }

    fn progress(&mut self, task_id: &str, pct: u8, note: Option<&str>) {
        if !self.telemetry_allowance() {
            return;
        }
        let msg = Outbound::Progress {
            task_id: task_id.to_owned(),
            pct,
            note: note.map(str::to_owned),
        };
        self.send(&msg);
    }

    fn done(&mut self, task_id: &str) {
        let msg = Outbound::Done {
            task_id: task_id.to_owned(),
        };
        self.send(&msg);
    }

    fn error(&mut self, task_id: Option<&str>, message: &str) {
        let msg = Outbound::Error {
            task_id: task_id.map(str::to_owned),
            message: message.to_owned(),
        };
        self.send(&msg);
    }
}

/// Exponential backoff: `min(base * 2^attempts * jitter, max)`.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempts: u32, jitter: f32) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempts.min(16));
    let jittered = (exp as f64 * f64::from(jitter)) as u64;
    jittered.min(max_ms)
}
