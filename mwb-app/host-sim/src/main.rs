//! Host-side simulator: runs the full control stack against a fake radio,
//! a scripted operator session, and a motor bus that logs frames instead of
//! moving motors. Useful for watching the control loop behave in real time
//! without hardware.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use mwb_core::utils::bus::{BusError, BusFrame, BusPort};
use mwb_core::utils::connection::client::ConnectivityManager;
use mwb_core::utils::connection::{
    LinkPort, LinkStatus, SessionEvent, SessionPort, TransportError,
};
use mwb_core::utils::system::{Snapshot, SystemController, Telemetry};
use mwb_core::utils::controllers::{WheelsConfig, WheelsController};

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// Control tick period in milliseconds
    #[clap(long, default_value_t = 33)]
    tick_ms: u64,
    /// How long to run before exiting, seconds
    #[clap(long, default_value_t = 10)]
    run_s: u64,
    /// Operator script: lines of `<at_ms> <json>`; '#' starts a comment.
    /// Without one, a built-in demo sequence runs.
    #[clap(long)]
    script: Option<PathBuf>,
}

/// A radio that is always associated.
struct SimLink;

impl LinkPort for SimLink {
    fn start_connect(&mut self) {
        info!("sim link: association requested");
    }

    fn status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn disconnect(&mut self) {}

    fn rssi(&self) -> i32 {
        -48
    }

    fn local_ip(&self) -> Option<String> {
        Some("192.168.69.2".into())
    }
}

/// Plays a timed script of operator messages and loops pings straight back.
struct ScriptedSession {
    started: Instant,
    script: VecDeque<(u64, String)>,
    handshook: bool,
    pending: VecDeque<SessionEvent>,
}

impl ScriptedSession {
    fn new(script: VecDeque<(u64, String)>) -> Self {
        ScriptedSession {
            started: Instant::now(),
            script,
            handshook: false,
            pending: VecDeque::new(),
        }
    }
}

impl SessionPort for ScriptedSession {
    fn start_connect(&mut self) {
        if !self.handshook {
            self.handshook = true;
            self.pending.push_back(SessionEvent::Connected);
        }
    }

    fn poll(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let elapsed = self.started.elapsed().as_millis() as u64;
        let due = self
            .script
            .front()
            .is_some_and(|(at_ms, _)| *at_ms <= elapsed);
        if due {
            self.script
                .pop_front()
                .map(|(_, text)| SessionEvent::Text(text))
        } else {
            None
        }
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        info!(%text, "to operator");
        Ok(())
    }

    fn send_ping(&mut self, t: u64) -> Result<(), TransportError> {
        self.pending.push_back(SessionEvent::Pong(t));
        Ok(())
    }

    fn close(&mut self) {
        self.handshook = false;
    }
}

/// Logs every frame instead of touching hardware.
struct LoggingBus;

impl BusPort for LoggingBus {
    fn probe(&mut self) -> bool {
        true
    }

    fn write_frame(&mut self, frame: &BusFrame) -> Result<(), BusError> {
        debug!(bytes = ?frame.to_bytes(), "bus frame");
        Ok(())
    }
}

struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn record(&mut self, snapshot: &Snapshot) {
        info!(
            session = snapshot.session_up,
            wheels = ?snapshot.wheels_current,
            target = ?snapshot.wheels_target,
            queues = ?snapshot.queue_depths,
            "telemetry"
        );
    }
}

fn demo_script() -> VecDeque<(u64, String)> {
    [
        (500, r#"{"kind":"drive","left":60,"right":60}"#),
        (700, r#"{"kind":"drive","left":60,"right":60}"#),
        (900, r#"{"kind":"drive","left":60,"right":-60}"#),
        (
            2000,
            r#"{"kind":"task.enqueue","tasks":[{"taskId":"demo-w1","device":"wheels","type":"drive","left":40,"right":40,"durationMs":1500},{"taskId":"demo-a1","device":"arm","type":"moveAngle","angle":120}]}"#,
        ),
        (5000, r#"{"kind":"task.cancel","device":"wheels"}"#),
    ]
    .into_iter()
    .map(|(at, text)| (at, text.to_owned()))
    .collect()
}

fn load_script(path: &PathBuf) -> VecDeque<(u64, String)> {
    let Ok(raw) = fs::read_to_string(path) else {
        warn!(path = %path.display(), "script unreadable, using demo");
        return demo_script();
    };
    let mut script = VecDeque::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((at, text)) = line.split_once(' ') else {
            warn!(line, "skipping malformed script line");
            continue;
        };
        match at.parse::<u64>() {
            Ok(at_ms) => script.push_back((at_ms, text.trim().to_owned())),
            Err(_) => warn!(line, "skipping malformed script line"),
        }
    }
    script
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();

    let script = match &opts.script {
        Some(path) => load_script(path),
        None => demo_script(),
    };
    info!(entries = script.len(), "operator script loaded");

    let conn = ConnectivityManager::new(SimLink, ScriptedSession::new(script), "mwb-sim");
    let wheels = WheelsController::new(LoggingBus, WheelsConfig::default());
    let mut sys = SystemController::new(conn, wheels, LogTelemetry);

    let started = Instant::now();
    sys.begin(0);
    info!(tick_ms = opts.tick_ms, run_s = opts.run_s, "simulator running");
    loop {
        let now_ms = started.elapsed().as_millis() as u64;
        if now_ms >= opts.run_s * 1000 {
            break;
        }
        sys.tick(now_ms);
        std::thread::sleep(Duration::from_millis(opts.tick_ms));
    }
    info!("simulator done");
}
