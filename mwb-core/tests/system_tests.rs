//! End-to-end tests: operator JSON in one side, motor bus frames out the
//! other, with the whole controller stack in between and time fully under
//! test control.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use mwb_core::utils::bus::{BusError, BusFrame, BusPort};
use mwb_core::utils::connection::client::ConnectivityManager;
use mwb_core::utils::connection::{
    LinkPort, LinkStatus, SessionEvent, SessionPort, TransportError,
};
use mwb_core::utils::controllers::{Actuator, WheelsConfig, WheelsController};
use mwb_core::utils::system::SystemController;

const TICK: u64 = 33;

struct TestBus {
    frames: Rc<RefCell<Vec<BusFrame>>>,
}

impl BusPort for TestBus {
    fn probe(&mut self) -> bool {
        true
    }

    fn write_frame(&mut self, frame: &BusFrame) -> Result<(), BusError> {
        self.frames.borrow_mut().push(*frame);
        Ok(())
    }
}

struct TestLink;

impl LinkPort for TestLink {
    fn start_connect(&mut self) {}

    fn status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn disconnect(&mut self) {}

    fn rssi(&self) -> i32 {
        -50
    }

    fn local_ip(&self) -> Option<String> {
        Some("10.0.0.2".into())
    }
}

#[derive(Default)]
struct SessionInner {
    script: VecDeque<SessionEvent>,
    sent: Vec<String>,
    pings: Vec<u64>,
    auto_connect: bool,
}

struct TestSession(Rc<RefCell<SessionInner>>);

impl SessionPort for TestSession {
    fn start_connect(&mut self) {
        let mut inner = self.0.borrow_mut();
        if inner.auto_connect {
            inner.script.push_back(SessionEvent::Connected);
        }
    }

    fn poll(&mut self) -> Option<SessionEvent> {
        self.0.borrow_mut().script.pop_front()
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.0.borrow_mut().sent.push(text.to_owned());
        Ok(())
    }

    fn send_ping(&mut self, t: u64) -> Result<(), TransportError> {
        self.0.borrow_mut().pings.push(t);
        Ok(())
    }

    fn close(&mut self) {}
}

struct Robot {
    sys: SystemController<TestBus, TestLink, TestSession, ()>,
    frames: Rc<RefCell<Vec<BusFrame>>>,
    session: Rc<RefCell<SessionInner>>,
}

impl Robot {
    fn push_text(&self, text: &str) {
        self.session
            .borrow_mut()
            .script
            .push_back(SessionEvent::Text(text.to_owned()));
    }

    fn sent(&self) -> Vec<String> {
        self.session.borrow().sent.clone()
    }
}

/// Boot a robot with the session already connected and the hello consumed.
fn boot() -> Robot {
    let frames = Rc::new(RefCell::new(Vec::new()));
    let session = Rc::new(RefCell::new(SessionInner {
        auto_connect: true,
        ..SessionInner::default()
    }));

    let conn = ConnectivityManager::with_seed(TestLink, TestSession(session.clone()), "mwb-1", 3);
    let wheels = WheelsController::new(
        TestBus {
            frames: frames.clone(),
        },
        WheelsConfig::default(),
    );
    let mut sys = SystemController::new(conn, wheels, ());
    sys.begin(0);
    sys.tick(0);
    assert!(sys.connectivity().is_session_connected());
    assert!(session.borrow().sent[0].contains(r#""kind":"hello""#));
    session.borrow_mut().sent.clear();
    // Dead sessions stay dead unless a test reconnects explicitly.
    session.borrow_mut().auto_connect = false;

    Robot {
        sys,
        frames,
        session,
    }
}

#[test]
fn test_drive_stream_reaches_hardware_bytes() {
    let mut robot = boot();
    let mut now = 0;
    for _ in 0..30 {
        now += TICK;
        robot.push_text(r#"{"kind":"drive","left":50,"right":-50}"#);
        robot.sys.tick(now);
    }

    assert_eq!(robot.sys.wheels().current_pct(), (50, -50));
    // Left forward and right backward both spin counter-clockwise on this
    // chassis; 50% maps to speed code 0x49.
    let last = robot.frames.borrow().last().copied().unwrap();
    assert_eq!(last.to_bytes(), [0x34, 0x34, 0x49, 0x49]);
}

#[test]
fn test_session_loss_fails_safe_in_one_tick() {
    let mut robot = boot();
    robot.push_text(
        r#"{"kind":"task.enqueue","tasks":[
            {"taskId":"w1","device":"wheels","type":"drive","left":80,"right":80},
            {"taskId":"a1","device":"arm","type":"moveAngle","angle":120,"durationMs":30000},
            {"taskId":"a2","device":"arm","type":"moveAngle","angle":10,"durationMs":30000}
        ]}"#,
    );
    let mut now = 0;
    for _ in 0..20 {
        now += TICK;
        robot.sys.tick(now);
    }
    assert!(robot.sys.wheels().current_pct().0 > 0);

    robot
        .session
        .borrow_mut()
        .script
        .push_back(SessionEvent::Disconnected);
    now += TICK;
    robot.sys.tick(now);

    // Same tick: wheels stopped dead, every task gone.
    assert_eq!(robot.sys.wheels().current_pct(), (0, 0));
    assert_eq!(robot.sys.wheels().target_pct(), (0, 0));
    assert_eq!(*robot.frames.borrow().last().unwrap(), BusFrame::STOP);
    for device in Actuator::ALL {
        assert!(!robot.sys.dispatcher().machine(device).is_running());
        assert_eq!(robot.sys.dispatcher().queue_len(device), 0);
    }

    // And it stays stopped.
    for _ in 0..20 {
        now += TICK;
        robot.sys.tick(now);
    }
    assert_eq!(robot.sys.wheels().current_pct(), (0, 0));
}

#[test]
fn test_commands_arriving_with_disconnect_are_discarded() {
    let mut robot = boot();
    // Both land in the same pump: a drive frame queued just ahead of the
    // close. The stale drive must not survive the fail-safe.
    robot.push_text(r#"{"kind":"drive","left":80,"right":80}"#);
    robot
        .session
        .borrow_mut()
        .script
        .push_back(SessionEvent::Disconnected);
    robot.sys.tick(TICK);

    assert!(!robot.sys.connectivity().is_session_connected());
    assert_eq!(robot.sys.wheels().target_pct(), (0, 0));
    assert_eq!(robot.sys.wheels().current_pct(), (0, 0));
    assert_eq!(*robot.frames.borrow().last().unwrap(), BusFrame::STOP);
}

#[test]
fn test_task_cancel_stops_wheels_and_reports() {
    let mut robot = boot();
    robot.push_text(
        r#"{"kind":"task.enqueue","tasks":[
            {"taskId":"w1","device":"wheels","type":"drive","left":70,"right":70},
            {"taskId":"w2","device":"wheels","type":"drive","left":30,"right":30,"durationMs":2000}
        ]}"#,
    );
    let mut now = 0;
    for _ in 0..15 {
        now += TICK;
        robot.sys.tick(now);
    }
    assert!(robot.sys.wheels().current_pct().0 > 0);
    assert_eq!(robot.sys.dispatcher().queue_len(Actuator::Wheels), 1);

    robot.push_text(r#"{"kind":"task.cancel","device":"wheels"}"#);
    now += TICK;
    robot.sys.tick(now);

    assert!(!robot.sys.dispatcher().machine(Actuator::Wheels).is_running());
    assert_eq!(robot.sys.dispatcher().queue_len(Actuator::Wheels), 0);
    assert_eq!(robot.sys.wheels().current_pct(), (0, 0));
    assert_eq!(*robot.frames.borrow().last().unwrap(), BusFrame::STOP);

    // The running task and the queued one both fail with the cancel reason.
    let sent = robot.sent();
    let errors: Vec<_> = sent
        .iter()
        .filter(|m| m.contains(r#""kind":"error""#))
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].contains(r#""taskId":"w1""#) && errors[0].contains("canceled"));
    assert!(errors[1].contains(r#""taskId":"w2""#) && errors[1].contains("canceled"));
}

#[test]
fn test_heartbeat_timeout_fails_safe() {
    let mut robot = boot();
    robot.push_text(
        r#"{"kind":"task.enqueue","tasks":[
            {"taskId":"w1","device":"wheels","type":"drive","left":40,"right":40}
        ]}"#,
    );

    // Never answer any liveness ping. Interval 15s, timeout 3s, three
    // misses: the session is declared dead at ~48s.
    let mut now = 0;
    while now < 50_000 {
        now += TICK;
        robot.sys.tick(now);
    }

    assert_eq!(robot.session.borrow().pings.len(), 3);
    assert!(!robot.sys.connectivity().is_session_connected());
    assert!(!robot.sys.dispatcher().machine(Actuator::Wheels).is_running());
    assert_eq!(robot.sys.wheels().current_pct(), (0, 0));
    assert_eq!(*robot.frames.borrow().last().unwrap(), BusFrame::STOP);
}

#[test]
fn test_task_batch_lifecycle_reports() {
    let mut robot = boot();
    robot.push_text(
        r#"{"kind":"task.enqueue","tasks":[
            {"taskId":"w1","device":"wheels","type":"drive","left":60,"right":60,"durationMs":500},
            {"taskId":"a1","device":"arm","type":"moveAngle","angle":90,"durationMs":400}
        ]}"#,
    );

    let mut now = 0;
    let mut peak = 0;
    while now < 1200 {
        now += TICK;
        robot.sys.tick(now);
        peak = peak.max(robot.sys.wheels().current_pct().0);
    }

    assert_eq!(peak, 60);
    // Timed wheels task over, nothing queued behind it: wheels ramp down.
    assert_eq!(robot.sys.wheels().target_pct(), (0, 0));

    let sent = robot.sent();
    let kinds = |needle: &str| sent.iter().filter(|m| m.contains(needle)).count();
    assert_eq!(kinds(r#""kind":"ack""#), 2);
    assert_eq!(kinds(r#""kind":"done""#), 2);
    assert!(kinds(r#""kind":"progress""#) >= 2);
    assert!(sent.iter().any(|m| m.contains(r#""taskId":"w1""#) && m.contains("done")));
    assert!(sent.iter().any(|m| m.contains(r#""taskId":"a1""#) && m.contains("done")));
}

#[test]
fn test_invalid_inputs_rejected_not_clamped() {
    let mut robot = boot();

    robot.push_text(r#"{"kind":"drive","left":500,"right":0}"#);
    robot.sys.tick(TICK);
    assert_eq!(robot.sys.wheels().target_pct(), (0, 0));

    // A bad task in a batch is rejected alone; its siblings still run.
    robot.push_text(
        r#"{"kind":"task.enqueue","tasks":[
            {"taskId":"bad","device":"arm","type":"moveAngle","angle":270},
            {"taskId":"good","device":"neck","type":"moveAngle","angle":45}
        ]}"#,
    );
    robot.sys.tick(2 * TICK);

    assert!(robot.sys.dispatcher().machine(Actuator::Neck).is_running());
    assert!(!robot.sys.dispatcher().machine(Actuator::Arm).is_running());

    let sent = robot.sent();
    let errors: Vec<_> = sent
        .iter()
        .filter(|m| m.contains(r#""kind":"error""#))
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].contains("left out of range"));
    assert!(errors[1].contains(r#""taskId":"bad""#));
    assert!(errors[1].contains("angle out of range"));
}

#[test]
fn test_ping_answered_with_pong() {
    let mut robot = boot();
    robot.push_text(r#"{"kind":"ping","t":12345}"#);
    robot.sys.tick(TICK);
    let sent = robot.sent();
    assert_eq!(sent, vec![r#"{"kind":"pong","t":12345}"#.to_owned()]);
}
