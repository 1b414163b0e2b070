#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/hidmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("socket never appeared at {}", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn spawn_call(sock_path: &Path, format: &str, call_args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_hidmux"))
        .args(["--log-level", "error", "--format", format])
        .arg("call")
        .arg(sock_path)
        .args(call_args)
        .args(["--timeout", "5s"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("call command should start")
}

fn run_agent(sock_path: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hidmux"))
        .args(["--log-level", "error", "run", "--socket"])
        .arg(sock_path)
        .output()
        .expect("agent should run")
}

#[test]
fn call_echo_against_agent_prints_result() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("device.sock");

    let call = spawn_call(&sock_path, "raw", &["echo", "--data", "hello hid"]);
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let agent = run_agent(&sock_path);
    let output = call.wait_with_output().expect("call should finish");

    assert!(output.status.success(), "{output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello hid");
    assert_eq!(agent.status.code(), Some(0), "{agent:?}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_method_reports_error_in_json() {
    let dir = unique_temp_dir("unknown");
    let sock_path = dir.join("device.sock");

    let call = spawn_call(&sock_path, "json", &["no_such_method"]);
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let agent = run_agent(&sock_path);
    let output = call.wait_with_output().expect("call should finish");

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"ok\":false"), "{stdout}");
    assert!(stdout.contains("Method 'no_such_method' not found!"), "{stdout}");
    assert!(agent.status.success());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_against_missing_socket_is_a_device_error() {
    let dir = unique_temp_dir("missing");
    let output = run_agent(&dir.join("absent.sock"));
    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_hex_is_rejected_before_binding() {
    let dir = unique_temp_dir("hex");
    let sock_path = dir.join("device.sock");
    let output = Command::new(env!("CARGO_BIN_EXE_hidmux"))
        .arg("call")
        .arg(&sock_path)
        .args(["echo", "--hex", "abc"])
        .output()
        .expect("call should run");

    assert_eq!(output.status.code(), Some(60));
    assert!(!sock_path.exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_name() {
    let output = Command::new(env!("CARGO_BIN_EXE_hidmux"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("hidmux "));
}
