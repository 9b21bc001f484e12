//! termsession - line-oriented terminal session demo
//!
//! Opens one session (local shell, `ssh` or container shell), prints decoded
//! output as it arrives and forwards stdin lines as submitted input.
//!
//! ```text
//! termsession [--ssh [user@]host[:port]] [--container ID]
//! ```
//!
//! Lines starting with `:` are handled locally:
//! - `:exec CMD` runs CMD to completion and prints the captured result
//! - `:cd DIR` changes directory without touching history
//! - `:int` sends SIGINT to the foreground job
//! - `:history` prints submitted commands
//! - `:quit` terminates the session

use std::io::Write;
use std::process::ExitCode;
use termsession::config::AppConfig;
use termsession::logging::{init_logging, LoggingConfig};
use termsession::session::{SessionKind, SessionState, TerminalSession};
use termsession::terminal::line_buffer::BufferSnapshot;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const USAGE: &str = "usage: termsession [--ssh [user@]host[:port]] [--container ID]";

fn parse_args(args: &[String]) -> Result<SessionKind, String> {
    match args {
        [] => Ok(SessionKind::Local),
        [flag, target] if flag == "--ssh" => SessionKind::parse_ssh_target(target)
            .ok_or_else(|| format!("invalid ssh target '{target}'")),
        [flag, id] if flag == "--container" && !id.is_empty() => {
            Ok(SessionKind::Container { id: id.clone() })
        }
        _ => Err(USAGE.to_string()),
    }
}

/// Print a snapshot. `can_replace` is false when the line `replace_last`
/// refers to was never rendered here.
fn render(out: &mut impl Write, snapshot: &BufferSnapshot, can_replace: bool) -> std::io::Result<()> {
    for (i, line) in snapshot.lines.iter().enumerate() {
        if i == 0 && snapshot.replace_last && can_replace {
            // Cursor up, clear line
            write!(out, "\x1b[1A\x1b[2K")?;
        }
        writeln!(out, "{}", line.text)?;
    }
    out.flush()
}

async fn run(session: TerminalSession) -> Result<(), String> {
    let mut output = session.subscribe_output();
    session.connect().await.map_err(|e| e.to_string())?;

    tokio::spawn(async move {
        let mut in_sync = true;
        loop {
            match output.recv().await {
                Ok(snapshot) => {
                    let _ = render(&mut std::io::stdout().lock(), &snapshot, in_sync);
                    in_sync = true;
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Lines were lost; mark the gap and append from here on
                    tracing::warn!(skipped, "Output consumer lagged");
                    eprintln!("[{skipped} output updates skipped]");
                    in_sync = false;
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut states = session.subscribe_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                tracing::debug!(%state, "State update");
                if let SessionState::AwaitingInput(label) = &state {
                    eprintln!("[{label}]");
                }
                if state.is_terminal() {
                    eprintln!("[{state}]");
                    break;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    session.terminate();
                    break;
                };
                if let Err(e) = handle_line(&session, &line).await {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    // Let the pump publish the last lines
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}

async fn handle_line(session: &TerminalSession, line: &str) -> Result<(), String> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        ":quit" => {
            session.terminate();
            Ok(())
        }
        ":int" => session.interrupt().map_err(|e| e.to_string()),
        ":cd" => session.change_directory(rest).map_err(|e| e.to_string()),
        ":history" => {
            for (i, entry) in session.history().iter().enumerate() {
                println!("{:>4}  {entry}", i + 1);
            }
            Ok(())
        }
        ":exec" => {
            let result = session.execute(rest).await.map_err(|e| e.to_string())?;
            print!("{}", result.output);
            eprint!("{}", result.error_output);
            println!("[exit {}]", result.exit_code);
            Ok(())
        }
        _ => session.send_input(line).map_err(|e| e.to_string()),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let kind = match parse_args(&args) {
        Ok(kind) => kind,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e}; using built-in defaults");
            AppConfig::default()
        }
    };
    let _log_guard = init_logging(&LoggingConfig::from(&config.logging));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(%kind, "Starting termsession");
    let session = TerminalSession::new(kind, &config);
    match rt.block_on(run(session)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
