//! Terminal sessions
//!
//! A [`TerminalSession`] composes one PTY, its line buffer, prompt detector
//! and input service behind a single contract that looks the same for a
//! local shell, an `ssh` login and a container shell.
//!
//! Output flows PTY reader → UTF-8 decoding → [`LineBuffer`] and
//! [`PromptDetector`]; a flush pump publishes [`BufferSnapshot`]s on a
//! broadcast channel and [`SessionState`] changes go out on a watch channel.

use crate::config::{AppConfig, PtyConfig, SessionConfig};
use crate::error::{PtyError, SessionError, SessionResult};
use crate::terminal::ansi::strip_ansi;
use crate::terminal::input::{InputService, Key, KeyOutcome};
use crate::terminal::line_buffer::{BufferSnapshot, LineBuffer};
use crate::terminal::prompt::{Detection, InputMode, PromptDetector};
use crate::terminal::pty::{PtyEvent, PtyProcess, Utf8Stream};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Stable session identifier
pub type SessionId = Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Session kind
// ============================================================================

/// Where the shell runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Local,
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
    },
    Container {
        id: String,
    },
}

impl SessionKind {
    /// Parse `[user@]host[:port]`
    pub fn parse_ssh_target(target: &str) -> Option<Self> {
        let target = target.trim();
        let (user, rest) = match target.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return None,
            None => (None, target),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
            None => (rest, None),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return None;
        }
        Some(SessionKind::Ssh {
            host: host.to_string(),
            user,
            port,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SessionKind::Local)
    }

    fn ssh_destination(host: &str, user: Option<&str>) -> String {
        match user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    /// Command line the PTY runs to open the interactive shell
    fn launch_command(&self, shell: &str, settings: &SessionConfig) -> String {
        let mut words: Vec<String> = vec!["exec".to_string()];
        match self {
            SessionKind::Local => {
                words.push(shell.to_string());
                words.push("-i".to_string());
            }
            SessionKind::Ssh { host, user, port } => {
                words.push(settings.ssh_program.clone());
                words.push("-t".to_string());
                if let Some(port) = port {
                    words.push("-p".to_string());
                    words.push(port.to_string());
                }
                words.push(Self::ssh_destination(host, user.as_deref()));
            }
            SessionKind::Container { id } => {
                words.push(settings.container_program.clone());
                words.push("exec".to_string());
                words.push("-it".to_string());
                words.push(id.clone());
                words.push("sh".to_string());
            }
        }
        join_quoted(&words)
    }

    /// Program and arguments for a one-shot, non-interactive command
    fn execute_invocation(
        &self,
        shell: &str,
        settings: &SessionConfig,
        command: &str,
        cwd: Option<&Path>,
    ) -> (String, Vec<String>) {
        match self {
            SessionKind::Local => (
                shell.to_string(),
                vec!["-c".to_string(), command.to_string()],
            ),
            SessionKind::Ssh { host, user, port } => {
                let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
                if let Some(port) = port {
                    args.push("-p".to_string());
                    args.push(port.to_string());
                }
                args.push(Self::ssh_destination(host, user.as_deref()));
                args.push("--".to_string());
                let quoted_dir = cwd.and_then(|dir| {
                    let dir = dir.to_string_lossy();
                    shlex::try_quote(&dir).ok().map(|q| q.into_owned())
                });
                let remote = match quoted_dir {
                    Some(dir) => format!("cd {dir} && {command}"),
                    None => command.to_string(),
                };
                args.push(remote);
                (settings.ssh_program.clone(), args)
            }
            SessionKind::Container { id } => {
                let mut args = vec!["exec".to_string()];
                if let Some(dir) = cwd {
                    args.push("-w".to_string());
                    args.push(dir.to_string_lossy().into_owned());
                }
                args.extend([id.clone(), "sh".to_string(), "-c".to_string(), command.to_string()]);
                (settings.container_program.clone(), args)
            }
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Local => f.write_str("local"),
            SessionKind::Ssh { host, user, port } => {
                write!(f, "ssh {}", Self::ssh_destination(host, user.as_deref()))?;
                if let Some(port) = port {
                    write!(f, ":{port}")?;
                }
                Ok(())
            }
            SessionKind::Container { id } => write!(f, "container {id}"),
        }
    }
}

fn join_quoted(words: &[String]) -> String {
    words
        .iter()
        .map(|w| {
            shlex::try_quote(w)
                .map(|q| q.into_owned())
                .unwrap_or_else(|_| w.replace('\0', ""))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Session state
// ============================================================================

/// Lifecycle of a session. `Disconnected` and `Error` are final.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// A command line was submitted and has not returned to the prompt
    Executing(String),
    /// The child is waiting on a prompt; carries the prompt label
    AwaitingInput(String),
    Disconnected(Option<String>),
    Error(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected(_) | SessionState::Error(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Executing(_) | SessionState::AwaitingInput(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Executing(command) => write!(f, "executing `{command}`"),
            SessionState::AwaitingInput(prompt) => write!(f, "awaiting input ({prompt})"),
            SessionState::Disconnected(None) => f.write_str("disconnected"),
            SessionState::Disconnected(Some(reason)) => write!(f, "disconnected: {reason}"),
            SessionState::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Captured result of [`TerminalSession::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Standard output with escape sequences removed
    pub output: String,
    pub error_output: String,
    /// Exit status; `128 + signal` when the process was killed
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ============================================================================
// Shared state
// ============================================================================

struct OutputStream {
    utf8: Utf8Stream,
    detector: PromptDetector,
}

struct SessionShared {
    id: SessionId,
    pty: Arc<PtyProcess>,
    buffer: LineBuffer,
    stream: Mutex<OutputStream>,
    /// Routed keystrokes collect here and are written after the lock is released
    input: Mutex<InputService<Vec<u8>>>,
    /// Serializes PTY writes in submission order; never taken by the reader
    write_order: Mutex<()>,
    /// Last command line submitted in normal mode
    current_command: Mutex<Option<String>>,
    cwd: Mutex<Option<PathBuf>>,
    connected: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    output_tx: broadcast::Sender<BufferSnapshot>,
}

impl SessionShared {
    /// Move to `next` unless the session already reached a final state
    fn set_state(&self, next: SessionState) -> bool {
        let id = self.id;
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!(session_id = %id, from = %state, to = %next, "Session state changed");
            *state = next;
            true
        })
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn on_pty_event(&self, event: PtyEvent) {
        match event {
            PtyEvent::Output(bytes) => self.on_output(&bytes),
            PtyEvent::Exited { exit_code, reason } => {
                self.connected.store(false, Ordering::SeqCst);
                let reason = reason.or_else(|| exit_code.map(|code| format!("exit status {code}")));
                info!(session_id = %self.id, reason = ?reason, "Session process exited");
                self.set_state(SessionState::Disconnected(reason));
            }
        }
    }

    fn on_output(&self, bytes: &[u8]) {
        let (text, detection) = {
            let mut stream = lock(&self.stream);
            let text = stream.utf8.decode(bytes);
            let detection = stream.detector.feed(&text);
            (text, detection)
        };
        if text.is_empty() {
            return;
        }
        self.buffer.append(&text, false);

        let Some(detection) = detection else {
            return;
        };
        lock(&self.input).apply_detection(&detection);

        match detection {
            Detection::Prompt { label, .. } => {
                self.set_state(SessionState::AwaitingInput(label));
            }
            Detection::ShellPrompt => {
                let state = self.state();
                if state.is_busy() || state == SessionState::Connecting {
                    lock(&self.current_command).take();
                    self.set_state(SessionState::Connected);
                }
            }
        }
    }

    /// Bookkeeping after a keystroke or submitted line
    fn after_input(&self, outcome: &KeyOutcome) {
        match outcome {
            KeyOutcome::Handled => {}
            KeyOutcome::Submitted { text, mode } => match mode {
                InputMode::Normal | InputMode::Multiline => {
                    if !text.trim().is_empty() {
                        *lock(&self.current_command) = Some(text.clone());
                        self.set_state(SessionState::Executing(text.clone()));
                    }
                }
                InputMode::Password | InputMode::Interactive => {
                    // The answered prompt must not match again
                    lock(&self.stream).detector.reset();
                    if matches!(self.state(), SessionState::AwaitingInput(_)) {
                        let command = lock(&self.current_command).clone().unwrap_or_default();
                        self.set_state(SessionState::Executing(command));
                    }
                }
            },
            KeyOutcome::Interrupted => {
                lock(&self.stream).detector.reset();
            }
        }
    }

    fn ensure_usable(&self) -> SessionResult<()> {
        let state = self.state();
        if state.is_terminal() || !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated {
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Run `f` against the input service, then write what it produced.
    ///
    /// The input lock is released before the PTY write: the reader thread
    /// needs it to apply detections and must keep draining output while a
    /// large submission is in flight.
    fn route<T>(&self, f: impl FnOnce(&mut InputService<Vec<u8>>) -> T) -> T {
        let _order = lock(&self.write_order);
        let (result, bytes) = {
            let mut input = lock(&self.input);
            let result = f(&mut input);
            (result, std::mem::take(input.sink_mut()))
        };
        if !bytes.is_empty() {
            self.pty.write(&bytes);
        }
        result
    }
}

// ============================================================================
// Terminal session
// ============================================================================

/// One logical terminal: a shell behind a PTY plus the state needed to
/// render its output and route keystrokes into it
pub struct TerminalSession {
    kind: SessionKind,
    shell: String,
    env: Vec<(String, String)>,
    pty_config: PtyConfig,
    session_config: SessionConfig,
    shared: Arc<SessionShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalSession {
    pub fn new(kind: SessionKind, config: &AppConfig) -> Self {
        let shell = config.shell.resolve_program();
        let pty_config = config.pty.clone();
        let input_config = config.input.clone();

        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (output_tx, _) = broadcast::channel(config.session.event_capacity.max(1));
        let initial_cwd = kind
            .is_local()
            .then(|| std::env::current_dir().ok())
            .flatten();

        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| {
            let observer = weak.clone();
            let pty = Arc::new(PtyProcess::with_options(
                move |event| {
                    if let Some(shared) = observer.upgrade() {
                        shared.on_pty_event(event);
                    }
                },
                shell.clone(),
                pty_config.max_pending_bytes,
                pty_config.read_chunk_size,
            ));

            SessionShared {
                id: Uuid::new_v4(),
                input: Mutex::new(InputService::new(Vec::new(), input_config.history_limit)),
                write_order: Mutex::new(()),
                pty,
                buffer: LineBuffer::new(),
                stream: Mutex::new(OutputStream {
                    utf8: Utf8Stream::new(),
                    detector: PromptDetector::new(
                        input_config.prompt_window,
                        &input_config.prompt_glyphs,
                    ),
                }),
                current_command: Mutex::new(None),
                cwd: Mutex::new(initial_cwd),
                connected: AtomicBool::new(false),
                state_tx,
                output_tx,
            }
        });

        Self {
            kind,
            shell,
            env: config.shell.env_pairs(),
            pty_config,
            session_config: config.session.clone(),
            shared,
            pump: Mutex::new(None),
        }
    }

    /// Start in `dir` instead of the process working directory
    pub fn with_working_dir(self, dir: impl Into<PathBuf>) -> Self {
        *lock(&self.shared.cwd) = Some(dir.into());
        self
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Working directory as last set through [`Self::change_directory`]
    pub fn current_directory(&self) -> Option<PathBuf> {
        lock(&self.shared.cwd).clone()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<BufferSnapshot> {
        self.shared.output_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn input_mode(&self) -> InputMode {
        lock(&self.shared.input).mode()
    }

    /// Pending input as it may be displayed (masked for passwords)
    pub fn display_buffer(&self) -> String {
        lock(&self.shared.input).display_buffer()
    }

    /// Submitted commands, oldest first
    pub fn history(&self) -> Vec<String> {
        lock(&self.shared.input)
            .history()
            .entries()
            .map(str::to_string)
            .collect()
    }

    /// Child pid while the shell runs
    pub fn pid(&self) -> Option<u32> {
        self.shared.pty.pid()
    }

    /// Spawn the interactive shell and start publishing output
    #[instrument(skip(self), fields(session_id = %self.shared.id, kind = %self.kind))]
    pub async fn connect(&self) -> SessionResult<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::Terminated {
                state: state.to_string(),
            });
        }
        if self.shared.pty.is_running() {
            return Err(PtyError::AlreadyRunning.into());
        }

        self.shared.set_state(SessionState::Connecting);
        let command = self.kind.launch_command(&self.shell, &self.session_config);
        let working_dir = self
            .kind
            .is_local()
            .then(|| self.current_directory())
            .flatten()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        debug!(command = %command, cwd = ?working_dir, "Launching session shell");
        if let Err(e) = self.shared.pty.start(
            &command,
            &self.env,
            &working_dir,
            self.pty_config.rows,
            self.pty_config.cols,
        ) {
            error!(error = %e, "Failed to start session");
            self.shared.set_state(SessionState::Error(e.to_string()));
            return Err(e.into());
        }

        self.shared.connected.store(true, Ordering::SeqCst);
        if !matches!(self.kind, SessionKind::Ssh { .. }) {
            self.shared.set_state(SessionState::Connected);
        }
        self.start_pump();
        info!("Session connected");
        Ok(())
    }

    fn start_pump(&self) {
        let shared = Arc::downgrade(&self.shared);
        let period = self.session_config.flush_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let snapshot = shared.buffer.flush();
                if snapshot.has_new_content {
                    // No receivers is fine; snapshots are not replayed.
                    let _ = shared.output_tx.send(snapshot);
                }
                if shared.state().is_terminal() && !shared.buffer.has_pending_content() {
                    debug!(session_id = %shared.id, "Output pump stopped");
                    break;
                }
            }
        });
        if let Some(previous) = lock(&self.pump).replace(task) {
            previous.abort();
        }
    }

    /// Run `command` to completion outside the interactive shell
    #[instrument(skip(self), fields(session_id = %self.shared.id))]
    pub async fn execute(&self, command: &str) -> SessionResult<CommandResult> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::Terminated {
                state: state.to_string(),
            });
        }

        let cwd = self.current_directory();
        let (program, args) =
            self.kind
                .execute_invocation(&self.shell, &self.session_config, command, cwd.as_deref());

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.kind.is_local() {
            if let Some(dir) = cwd.as_deref().filter(|d| d.is_dir()) {
                cmd.current_dir(dir);
            }
        }

        let output = cmd.output().await.map_err(|e| SessionError::CommandFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        let result = CommandResult {
            output: strip_ansi(&String::from_utf8_lossy(&output.stdout)),
            error_output: strip_ansi(&String::from_utf8_lossy(&output.stderr)),
            exit_code: exit_code_of(&output.status),
        };
        debug!(exit_code = result.exit_code, bytes = output.stdout.len(), "Command finished");
        Ok(result)
    }

    /// Replace the pending input with `text` and submit it
    pub fn send_input(&self, text: &str) -> SessionResult<()> {
        self.shared.ensure_usable()?;
        // State is updated before the bytes reach the child, so a fast
        // prompt cannot be applied first.
        self.shared.route(|input| {
            let outcome = input.send_input(text);
            self.shared.after_input(&outcome);
        });
        Ok(())
    }

    pub fn send_character(&self, c: char) -> SessionResult<()> {
        self.handle_key(Key::Char(c)).map(|_| ())
    }

    pub fn submit_current_input(&self) -> SessionResult<KeyOutcome> {
        self.handle_key(Key::Enter)
    }

    pub fn handle_key(&self, key: Key) -> SessionResult<KeyOutcome> {
        self.shared.ensure_usable()?;
        Ok(self.shared.route(|input| {
            let outcome = input.handle_key(key);
            self.shared.after_input(&outcome);
            outcome
        }))
    }

    /// Write raw bytes (escape sequences, control codes) to the shell
    pub fn send_control_sequence(&self, bytes: &[u8]) -> SessionResult<()> {
        self.shared.ensure_usable()?;
        self.shared.route(|input| input.send_control_sequence(bytes));
        Ok(())
    }

    /// SIGINT to the foreground job; pending input is discarded
    pub fn interrupt(&self) -> SessionResult<()> {
        self.shared.ensure_usable()?;
        lock(&self.shared.input).reset();
        lock(&self.shared.stream).detector.reset();
        match self.shared.pty.interrupt() {
            Ok(()) => Ok(()),
            Err(PtyError::NotRunning) => Err(SessionError::Terminated {
                state: self.state().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the shell. The session cannot be reconnected afterwards.
    #[instrument(skip(self), fields(session_id = %self.shared.id))]
    pub fn terminate(&self) {
        self.shared.pty.terminate();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.set_state(SessionState::Disconnected(None));
    }

    /// `cd` in the shell without recording it in history
    pub fn change_directory(&self, path: &str) -> SessionResult<()> {
        self.shared.ensure_usable()?;
        let quoted = shlex::try_quote(path).map_err(|e| SessionError::CommandFailed {
            command: format!("cd {path}"),
            reason: e.to_string(),
        })?;
        self.shared
            .route(|input| input.send_control_sequence(format!("cd {quoted}\n").as_bytes()));

        let mut cwd = lock(&self.shared.cwd);
        let next = if self.kind.is_local() {
            let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
            match cwd.as_ref() {
                Some(current) if expanded.is_relative() => current.join(expanded),
                _ => expanded,
            }
        } else {
            match cwd.as_ref() {
                Some(current) if !path.starts_with('/') && !path.starts_with('~') => current.join(path),
                _ => PathBuf::from(path),
            }
        };
        debug!(cwd = ?next, "Working directory changed");
        *cwd = Some(next);
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> SessionResult<()> {
        self.shared.pty.resize(rows, cols)?;
        Ok(())
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        if self.shared.pty.is_running() {
            warn!(session_id = %self.shared.id, "Session dropped while running, terminating");
            self.shared.pty.terminate();
        }
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.shared.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
