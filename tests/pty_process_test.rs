//! PTY process integration tests
//!
//! Run with: cargo test --test pty_process_test
//!
//! Every test spawns `/bin/sh` on a real pseudo-terminal and bounds each wait
//! with a deadline.

#![cfg(unix)]

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use termsession::error::PtyError;
use termsession::terminal::pty::{
    PtyEvent, PtyProcess, DEFAULT_MAX_PENDING_BYTES, DEFAULT_READ_CHUNK_SIZE,
    EXEC_FAILED_EXIT_CODE,
};

const DEADLINE: Duration = Duration::from_secs(10);

fn spawn_process() -> (PtyProcess, Receiver<PtyEvent>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let process = PtyProcess::with_options(
        move |event| {
            let _ = tx.lock().unwrap().send(event);
        },
        "/bin/sh".to_string(),
        DEFAULT_MAX_PENDING_BYTES,
        DEFAULT_READ_CHUNK_SIZE,
    );
    (process, rx)
}

fn start(process: &PtyProcess, command: &str) {
    process
        .start(command, &[], Path::new("/"), 24, 80)
        .expect("spawn should succeed");
}

/// Accumulate output until `done` holds for it, or the process exits
fn read_until(rx: &Receiver<PtyEvent>, mut done: impl FnMut(&str, bool) -> bool) -> (String, bool) {
    let deadline = Instant::now() + DEADLINE;
    let mut output = Vec::new();
    let mut exited = false;
    loop {
        let text = String::from_utf8_lossy(&output).into_owned();
        if done(&text, exited) {
            return (text, exited);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(PtyEvent::Output(bytes)) => output.extend(bytes),
            Ok(PtyEvent::Exited { .. }) => exited = true,
            Err(RecvTimeoutError::Timeout) => panic!("timed out; output so far: {text:?}"),
            Err(RecvTimeoutError::Disconnected) => return (text, exited),
        }
    }
}

fn read_to_exit(rx: &Receiver<PtyEvent>) -> String {
    read_until(rx, |_, exited| exited).0
}

#[test]
fn test_output_and_exit_status() {
    let (process, rx) = spawn_process();
    start(&process, "printf 'hello from pty\\n'; exit 3");

    let output = read_to_exit(&rx);
    assert!(output.contains("hello from pty"), "output: {output:?}");
    assert!(!process.is_running());
    assert_eq!(process.wait_for_exit(), Some(3));
    assert_eq!(process.try_exit_code(), Some(3));
}

#[test]
fn test_exec_failure_status() {
    let (process, rx) = spawn_process();
    start(&process, "/nonexistent/termsession-test-binary");

    read_to_exit(&rx);
    assert_eq!(process.wait_for_exit(), Some(EXEC_FAILED_EXIT_CODE));
}

#[test]
fn test_term_is_forced() {
    let (process, rx) = spawn_process();
    let env = vec![("TERM".to_string(), "dumb".to_string()), ("GREETING".to_string(), "hi".to_string())];
    process
        .start("echo \"$TERM $GREETING\"", &env, Path::new("/"), 24, 80)
        .unwrap();

    let output = read_to_exit(&rx);
    assert!(output.contains("xterm-256color hi"), "output: {output:?}");
}

#[test]
fn test_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    let (process, rx) = spawn_process();
    process.start("pwd -P", &[], dir.path(), 24, 80).unwrap();

    let output = read_to_exit(&rx);
    assert!(
        output.contains(expected.to_str().unwrap()),
        "output: {output:?}"
    );
}

#[test]
fn test_write_reaches_child() {
    let (process, rx) = spawn_process();
    start(&process, "read line; echo \"got:$line\"");

    process.write(b"ping\n");
    let (output, _) = read_until(&rx, |text, exited| text.contains("got:ping") || exited);
    assert!(output.contains("got:ping"), "output: {output:?}");
    read_to_exit(&rx);
}

#[test]
fn test_resize_is_visible_to_child() {
    let (process, rx) = spawn_process();
    start(&process, "read _; stty size");

    process.resize(40, 100).unwrap();
    process.write(b"\n");
    let output = read_to_exit(&rx);
    assert!(output.contains("40 100"), "output: {output:?}");
}

#[test]
fn test_interrupt_stops_foreground_job() {
    let (process, rx) = spawn_process();
    start(&process, "echo ready; sleep 30");

    read_until(&rx, |text, _| text.contains("ready"));
    let started = Instant::now();
    process.interrupt().unwrap();
    read_to_exit(&rx);
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[test]
fn test_already_running_and_idempotent_terminate() {
    let (process, rx) = spawn_process();
    start(&process, "sleep 30");

    let second = process.start("true", &[], Path::new("/"), 24, 80);
    assert!(matches!(second, Err(PtyError::AlreadyRunning)));

    process.terminate();
    process.terminate();
    assert!(!process.is_running());
    // Reaps whatever teardown left behind; must not hang
    process.wait_for_exit();

    let exits = rx
        .try_iter()
        .filter(|e| matches!(e, PtyEvent::Exited { .. }))
        .count();
    assert_eq!(exits, 1);
}

#[test]
fn test_restart_after_exit() {
    let (process, rx) = spawn_process();
    start(&process, "echo first");
    assert!(read_to_exit(&rx).contains("first"));

    start(&process, "echo second");
    assert!(read_to_exit(&rx).contains("second"));
}

#[test]
fn test_operations_after_exit_are_noops() {
    let (process, rx) = spawn_process();
    start(&process, "true");
    read_to_exit(&rx);

    process.write(b"ignored\n");
    assert!(process.resize(10, 10).is_ok());
    assert!(matches!(process.interrupt(), Err(PtyError::NotRunning)));
    process.terminate();
}

#[test]
fn test_large_output_arrives_in_order() {
    let (process, rx) = spawn_process();
    start(&process, "i=0; while [ $i -lt 2000 ]; do echo \"line $i\"; i=$((i+1)); done");

    let output = read_to_exit(&rx);
    let lines: Vec<&str> = output
        .split("\r\n")
        .filter(|l| l.starts_with("line "))
        .collect();
    let expected: Vec<String> = (0..2000).map(|i| format!("line {i}")).collect();
    assert_eq!(lines, expected);
}

#[test]
fn test_drop_terminates_child() {
    let (process, rx) = spawn_process();
    start(&process, "sleep 30");
    let started = Instant::now();
    drop(process);

    let exited = rx
        .iter()
        .any(|e| matches!(e, PtyEvent::Exited { .. }));
    assert!(exited);
    assert!(started.elapsed() < DEADLINE);
}
