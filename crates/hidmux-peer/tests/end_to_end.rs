#![cfg(unix)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use hidmux_device::DeviceStream;
use hidmux_frame::{WireRead, WireWrite};
use hidmux_peer::{
    accept_controller, connect_agent, AgentConfig, Channel, ControlMessage, Controller,
    ControllerListener, Direction, PeerError, ShutdownReason,
};

const WAIT: Duration = Duration::from_secs(5);

struct Session {
    controller: Controller,
    agent: JoinHandle<ShutdownReason>,
}

fn session() -> Session {
    let (agent_dev, controller_dev) = DeviceStream::pair().unwrap();
    let config = AgentConfig::default();

    let accept = {
        let config = config.clone();
        thread::spawn(move || accept_controller(controller_dev, &config).unwrap())
    };
    let engine = connect_agent(agent_dev, &config).unwrap();
    let controller = accept.join().unwrap();
    let agent = thread::spawn(move || engine.run());

    assert_eq!(controller.next_event(WAIT), Some(ControlMessage::StageReady));
    Session { controller, agent }
}

impl Session {
    fn finish(self) {
        self.controller.destroy(WAIT).unwrap();
        assert_eq!(self.agent.join().unwrap(), ShutdownReason::Destroyed);
    }
}

fn create_proc(controller: &Controller, program: &str, args: &str) -> (u32, [u32; 3]) {
    let mut request = BytesMut::new();
    request.put_u8(1);
    request.put_cstring(program);
    request.put_cstring(args);

    let mut response = controller
        .call("create_proc", request.freeze(), WAIT)
        .unwrap();
    let pid = response.take_u32().unwrap();
    assert_eq!(response.take_u8().unwrap(), 1);
    let ids = [
        response.take_u32().unwrap(),
        response.take_u32().unwrap(),
        response.take_u32().unwrap(),
    ];
    (pid, ids)
}

fn read_until(channel: &Arc<dyn Channel>, expected: &[u8]) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    let mut received = Vec::new();
    while received.len() < expected.len() {
        assert!(
            Instant::now() < deadline,
            "timed out, got {:?}",
            String::from_utf8_lossy(&received)
        );
        match channel.read() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => thread::sleep(Duration::from_millis(5)),
        }
    }
    received
}

/// Collect events until `done` matches one, returning everything seen.
fn events_until(
    controller: &Controller,
    mut done: impl FnMut(&ControlMessage) -> bool,
) -> Vec<ControlMessage> {
    let deadline = Instant::now() + WAIT;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        if let Some(event) = controller.next_event(Duration::from_millis(50)) {
            let finished = done(&event);
            events.push(event);
            if finished {
                return events;
            }
        }
    }
    panic!("expected event never arrived, saw {events:?}");
}

#[test]
fn echo_and_unknown_method() {
    let session = session();
    let controller = &session.controller;

    let echoed = controller
        .call("echo", Bytes::from_static(&[1, 2, 3]), WAIT)
        .unwrap();
    assert_eq!(echoed.as_ref(), &[1u8, 2, 3]);

    let large = Bytes::from((0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    assert_eq!(controller.call("echo", large.clone(), WAIT).unwrap(), large);

    match controller.call("no_such_method", Bytes::new(), WAIT) {
        Err(PeerError::Remote(message)) => {
            assert_eq!(message, "Method 'no_such_method' not found!")
        }
        other => panic!("unexpected result: {other:?}"),
    }

    session.finish();
}

#[test]
fn process_output_flows_after_link() {
    let session = session();
    let controller = &session.controller;

    let (pid, ids) = create_proc(controller, "echo", "hello hidmux");
    assert_ne!(pid, 0);
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);
    assert!(ids.iter().all(|id| *id != 0));

    let stdin = controller.channel(ids[0]).unwrap();
    let stdout = controller.channel(ids[1]).unwrap();
    assert_eq!(stdin.direction(), Direction::Out);
    assert_eq!(stdout.direction(), Direction::In);

    controller.link_channel(ids[1]);
    assert_eq!(read_until(&stdout, b"hello hidmux\n"), b"hello hidmux\n");

    let events = events_until(controller, |event| {
        matches!(event, ControlMessage::ProcessExited { pid: exited, .. } if *exited == pid)
    });
    assert!(events.contains(&ControlMessage::ProcessExited { pid, code: 0 }));

    // No second exit report for the same process.
    let later: Vec<ControlMessage> =
        std::iter::from_fn(|| controller.next_event(Duration::from_millis(200))).collect();
    assert!(!later
        .iter()
        .any(|event| matches!(event, ControlMessage::ProcessExited { .. })));

    match controller.call("kill_proc", Bytes::copy_from_slice(&pid.to_be_bytes()), WAIT) {
        Err(PeerError::Remote(message)) => {
            assert!(message.ends_with(&format!("Process with ID {pid} not known")))
        }
        other => panic!("unexpected result: {other:?}"),
    }

    session.finish();
}

#[test]
fn stdin_reaches_process_and_kill_reports_exit() {
    let session = session();
    let controller = &session.controller;

    let (pid, ids) = create_proc(controller, "cat", "");
    let stdin = controller.channel(ids[0]).unwrap();
    let stdout = controller.channel(ids[1]).unwrap();
    controller.link_channel(ids[1]);

    stdin.write(Bytes::from_static(b"ping\n"));
    assert_eq!(read_until(&stdout, b"ping\n"), b"ping\n");

    let killed = controller
        .call("kill_proc", Bytes::copy_from_slice(&pid.to_be_bytes()), WAIT)
        .unwrap();
    assert_eq!(killed.as_ref(), pid.to_be_bytes());

    let events = events_until(controller, |event| {
        matches!(event, ControlMessage::ProcessExited { pid: exited, .. } if *exited == pid)
    });
    assert!(events.contains(&ControlMessage::ProcessExited { pid, code: -1 }));

    session.finish();
}

#[test]
fn listener_accepts_agent_over_socket() {
    let path = std::env::temp_dir().join(format!(
        "hidmux-e2e-{}-{}.sock",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos()
    ));
    let listener = ControllerListener::bind(&path).unwrap();

    let agent = {
        let path = path.clone();
        thread::spawn(move || {
            let engine =
                hidmux_peer::connect_agent_socket(&path, &AgentConfig::default()).unwrap();
            engine.run()
        })
    };
    let controller = listener.accept().unwrap();
    assert_eq!(controller.next_event(WAIT), Some(ControlMessage::StageReady));

    let pwd = controller.call("pwd", Bytes::new(), WAIT).unwrap();
    assert!(!pwd.is_empty());

    controller.destroy(WAIT).unwrap();
    assert_eq!(agent.join().unwrap(), ShutdownReason::Destroyed);
}
