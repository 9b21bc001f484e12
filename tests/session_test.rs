//! Terminal session integration tests
//!
//! Run with: cargo test --test session_test
//!
//! Sessions run `/bin/sh -i` on a real pseudo-terminal; every wait is bounded.

#![cfg(unix)]

use std::time::Duration;
use termsession::config::AppConfig;
use termsession::error::SessionError;
use termsession::session::{SessionKind, SessionState, TerminalSession};
use termsession::terminal::line_buffer::BufferSnapshot;
use termsession::terminal::prompt::InputMode;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(10);

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.shell.program = Some("/bin/sh".to_string());
    config.session.flush_interval_ms = 5;
    config
}

fn local_session() -> TerminalSession {
    TerminalSession::new(SessionKind::Local, &test_config()).with_working_dir("/")
}

/// Collect rendered lines until one satisfies `matches`
async fn wait_for_line(
    rx: &mut broadcast::Receiver<BufferSnapshot>,
    matches: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut seen = Vec::new();
    let result = timeout(DEADLINE, async {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    let found = snapshot.lines.iter().any(|l| matches(l.text.trim_end()));
                    seen.extend(snapshot.lines.into_iter().map(|l| l.text));
                    if found {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out; lines so far: {seen:?}");
    seen
}

/// Wait for the first shell prompt so typed input is not echoed ahead of it
async fn connect_at_prompt(
    session: &TerminalSession,
    output: &mut broadcast::Receiver<BufferSnapshot>,
) {
    session.connect().await.unwrap();
    wait_for_line(output, |line| line.ends_with(['$', '#', '%', '>'])).await;
}

async fn wait_for_state(
    rx: &mut watch::Receiver<SessionState>,
    matches: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    timeout(DEADLINE, rx.wait_for(matches))
        .await
        .expect("state change timed out")
        .expect("state channel closed")
        .clone()
}

#[tokio::test]
async fn test_connect_and_run_command() {
    let session = local_session();
    let mut output = session.subscribe_output();
    let mut states = session.subscribe_state();

    connect_at_prompt(&session, &mut output).await;
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.is_connected());
    assert!(session.pid().is_some());

    session.send_input("echo hello-session").unwrap();
    assert_eq!(session.history(), vec!["echo hello-session"]);

    wait_for_line(&mut output, |line| line.ends_with("hello-session") && !line.contains("echo")).await;
    wait_for_state(&mut states, |s| *s == SessionState::Connected).await;

    session.terminate();
}

#[tokio::test]
async fn test_execute_captures_streams_and_status() {
    let session = local_session();
    let result = session
        .execute("echo out; echo err >&2; exit 4")
        .await
        .unwrap();

    assert_eq!(result.output, "out\n");
    assert_eq!(result.error_output, "err\n");
    assert_eq!(result.exit_code, 4);
    assert!(!result.success());
    // Out-of-band commands leave the session untouched
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_execute_strips_escape_sequences() {
    let session = local_session();
    let result = session
        .execute("printf '\\033[32mgreen\\033[0m\\n'")
        .await
        .unwrap();
    assert_eq!(result.output, "green\n");
    assert!(result.success());
}

#[tokio::test]
async fn test_change_directory_skips_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let session = local_session();
    let mut output = session.subscribe_output();

    connect_at_prompt(&session, &mut output).await;
    session.change_directory(&path).unwrap();
    assert_eq!(session.current_directory(), Some(dir.path().to_path_buf()));

    session.send_input("pwd").unwrap();
    wait_for_line(&mut output, |line| line.ends_with(path.as_str()) && !line.contains("pwd")).await;
    assert_eq!(session.history(), vec!["pwd"]);

    let result = session.execute("pwd").await.unwrap();
    assert_eq!(result.output.trim_end(), path);

    session.terminate();
}

#[tokio::test]
async fn test_password_prompt_is_masked_and_kept_out_of_history() {
    let session = local_session();
    let mut output = session.subscribe_output();
    let mut states = session.subscribe_state();

    connect_at_prompt(&session, &mut output).await;
    session
        .send_input("printf 'Password: '; read -r secret; echo \"len=${#secret}\"")
        .unwrap();

    let state = wait_for_state(&mut states, |s| matches!(s, SessionState::AwaitingInput(_))).await;
    assert_eq!(state, SessionState::AwaitingInput("password".to_string()));
    assert_eq!(session.input_mode(), InputMode::Password);

    for c in "hunter2".chars() {
        session.send_character(c).unwrap();
    }
    assert_eq!(session.display_buffer(), "•••••••");
    session.submit_current_input().unwrap();

    wait_for_line(&mut output, |line| line.ends_with("len=7")).await;
    assert_eq!(session.input_mode(), InputMode::Normal);
    assert_eq!(session.history().len(), 1);
    assert!(!session.history().iter().any(|h| h.contains("hunter2")));

    session.terminate();
}

#[tokio::test]
async fn test_interrupt_returns_to_prompt() {
    let session = local_session();
    let mut output = session.subscribe_output();
    let mut states = session.subscribe_state();

    connect_at_prompt(&session, &mut output).await;
    session.send_input("echo started; sleep 30").unwrap();
    assert!(session.state().is_busy());
    wait_for_line(&mut output, |line| line.ends_with("started") && !line.contains("echo")).await;

    session.interrupt().unwrap();
    wait_for_state(&mut states, |s| *s == SessionState::Connected).await;
    assert!(session.is_connected());

    session.terminate();
}

#[tokio::test]
async fn test_large_submission_while_output_matches_prompts() {
    let session = local_session();
    let mut output = session.subscribe_output();
    connect_at_prompt(&session, &mut output).await;
    session.send_input("cat").unwrap();

    // Every echoed line ends in a prompt glyph, so the reader applies a
    // detection for each chunk while the submission is still being written.
    let payload = (0..20_000)
        .map(|i| format!("row {i} $"))
        .collect::<Vec<_>>()
        .join("\n");
    session.send_input(&payload).unwrap();

    wait_for_line(&mut output, |line| line == "row 19999 $").await;
    session.terminate();
}

#[tokio::test]
async fn test_shell_exit_disconnects() {
    let session = local_session();
    let mut states = session.subscribe_state();

    session.connect().await.unwrap();
    session.send_input("exit 5").unwrap();

    let state = wait_for_state(&mut states, SessionState::is_terminal).await;
    assert!(matches!(state, SessionState::Disconnected(_)), "state: {state}");
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_terminate_is_final() {
    let session = local_session();
    session.connect().await.unwrap();

    session.terminate();
    session.terminate();
    assert!(matches!(session.state(), SessionState::Disconnected(_)));

    assert!(matches!(
        session.send_input("ls"),
        Err(SessionError::Terminated { .. })
    ));
    assert!(matches!(
        session.connect().await,
        Err(SessionError::Terminated { .. })
    ));
    assert!(matches!(
        session.execute("true").await,
        Err(SessionError::Terminated { .. })
    ));
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let session = local_session();
    session.connect().await.unwrap();

    assert!(matches!(session.connect().await, Err(SessionError::Pty(_))));
    assert_eq!(session.state(), SessionState::Connected);

    session.terminate();
}

#[tokio::test]
async fn test_resize_while_connected() {
    let session = local_session();
    let mut output = session.subscribe_output();
    connect_at_prompt(&session, &mut output).await;

    session.resize(33, 91).unwrap();
    session.send_input("stty size").unwrap();
    wait_for_line(&mut output, |line| line.ends_with("33 91")).await;

    session.terminate();
}
