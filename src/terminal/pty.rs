//! PTY (Pseudo-Terminal) process management
//!
//! Owns one child shell behind a pseudo-terminal. A dedicated reader thread
//! sleeps in `poll(2)` on the non-blocking master fd, drains it on readiness
//! and hands the bytes to a single observer through an [`OutputBatcher`].
//! End of file and explicit termination share one teardown path.

use crate::error::{PtyError, PtyResult};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// Exit status reported when the shell cannot execute the requested command
pub const EXEC_FAILED_EXIT_CODE: u32 = 127;

/// Default cap on undelivered output (100 KiB)
pub const DEFAULT_MAX_PENDING_BYTES: usize = 100 * 1024;

/// Default size of one read from the master fd
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Longest a single write waits for the master to become writable
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(2);

/// Shell used when neither the caller nor `$SHELL` names one
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// `$SHELL`, or [`FALLBACK_SHELL`]
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Notification from a running PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes read from the child, in order
    Output(Vec<u8>),
    /// The process is gone and every resource has been released
    Exited {
        exit_code: Option<u32>,
        reason: Option<String>,
    },
}

/// Observer registered at construction
pub type PtyEventHandler = Arc<dyn Fn(PtyEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Output batching
// ============================================================================

#[derive(Debug, Default)]
struct BatchState {
    pending: Vec<u8>,
    delivering: bool,
}

/// Coalesces reads so that only one delivery is in flight at a time.
///
/// Data pushed during a delivery is queued and flushed right after it, in
/// order. When the consumer falls behind, the oldest bytes beyond
/// `max_pending` are discarded.
#[derive(Debug)]
pub struct OutputBatcher {
    state: Mutex<BatchState>,
    max_pending: usize,
}

impl OutputBatcher {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(BatchState::default()),
            max_pending: max_pending.max(1),
        }
    }

    /// Queue `data` and, unless another caller is already delivering, drain
    /// the queue through `deliver`.
    pub fn push(&self, data: &[u8], deliver: impl Fn(Vec<u8>)) {
        {
            let mut state = lock(&self.state);
            state.pending.extend_from_slice(data);
            if state.pending.len() > self.max_pending {
                let mut excess = state.pending.len() - self.max_pending;
                // Do not start the kept data inside a UTF-8 sequence
                while excess < state.pending.len() && (state.pending[excess] & 0xC0) == 0x80 {
                    excess += 1;
                }
                state.pending.drain(..excess);
                warn!(dropped = excess, "PTY output backlog over limit, dropping oldest bytes");
            }
            if state.delivering {
                return;
            }
            state.delivering = true;
        }

        loop {
            let chunk = {
                let mut state = lock(&self.state);
                if state.pending.is_empty() {
                    state.delivering = false;
                    return;
                }
                std::mem::take(&mut state.pending)
            };
            deliver(chunk);
        }
    }

    /// Bytes waiting for delivery
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

// ============================================================================
// UTF-8 stream decoding
// ============================================================================

/// Incremental UTF-8 decoder for a byte stream
///
/// A multi-byte character split across reads is held back until its
/// remaining bytes arrive. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[..valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a character
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// PTY process
// ============================================================================

/// Live resources of a running child. Dropping it closes the master fd.
struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    master_fd: RawFd,
    pid: Option<u32>,
    wake: UnixStream,
    reader_thread: Option<JoinHandle<()>>,
    reader_thread_id: ThreadId,
}

#[derive(Default)]
struct ExitState {
    finished: bool,
    exit_code: Option<u32>,
    /// Child that had not exited at teardown; reaped by `wait_for_exit`
    lingering: Option<Box<dyn Child + Send + Sync>>,
}

struct PtyInner {
    handle: Mutex<Option<PtyHandle>>,
    running: AtomicBool,
    exit: Mutex<ExitState>,
    exit_cv: Condvar,
    batcher: OutputBatcher,
    handler: PtyEventHandler,
}

impl PtyInner {
    /// Shared teardown for EOF, read errors, explicit termination and drop.
    ///
    /// Returns false when another caller already tore the process down.
    fn shutdown(&self, reason: Option<String>) -> bool {
        let Some(mut handle) = lock(&self.handle).take() else {
            return false;
        };
        self.running.store(false, Ordering::SeqCst);
        debug!(pid = ?handle.pid, reason = ?reason, "Tearing down PTY process");

        // Stop the reader first so it never polls a closed descriptor.
        let _ = handle.wake.write_all(&[1]);
        if let Some(reader) = handle.reader_thread.take() {
            if handle.reader_thread_id != thread::current().id() {
                if reader.join().is_err() {
                    error!("PTY reader thread panicked");
                }
            }
        }

        let mut exit_code = None;
        let mut lingering = None;
        match handle.child.try_wait() {
            Ok(Some(status)) => exit_code = Some(status.exit_code()),
            Ok(None) => {
                if let Some(pid) = handle.pid {
                    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
                    }
                }
                match handle.child.try_wait() {
                    Ok(Some(status)) => exit_code = Some(status.exit_code()),
                    _ => lingering = Some(handle.child),
                }
            }
            Err(e) => warn!(error = %e, "Failed to reap PTY child"),
        }

        // Closes the master fd (writer, then master)
        drop(handle.writer);
        drop(handle.master);

        {
            let mut exit = lock(&self.exit);
            exit.finished = true;
            exit.exit_code = exit_code;
            exit.lingering = lingering;
        }
        self.exit_cv.notify_all();

        info!(exit_code = ?exit_code, "PTY process stopped");
        (self.handler)(PtyEvent::Exited { exit_code, reason });
        true
    }

    fn deliver(&self, data: &[u8]) {
        self.batcher
            .push(data, |chunk| (self.handler)(PtyEvent::Output(chunk)));
    }
}

/// One child process attached to a pseudo-terminal
///
/// `idle → running → (eof | terminated) → idle`; a stopped process can be
/// started again.
pub struct PtyProcess {
    inner: Arc<PtyInner>,
    shell: String,
    read_chunk_size: usize,
}

impl PtyProcess {
    /// Create an idle process handle delivering events to `handler`
    pub fn new(handler: impl Fn(PtyEvent) + Send + Sync + 'static) -> Self {
        Self::with_options(handler, default_shell(), DEFAULT_MAX_PENDING_BYTES, DEFAULT_READ_CHUNK_SIZE)
    }

    pub fn with_options(
        handler: impl Fn(PtyEvent) + Send + Sync + 'static,
        shell: String,
        max_pending_bytes: usize,
        read_chunk_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PtyInner {
                handle: Mutex::new(None),
                running: AtomicBool::new(false),
                exit: Mutex::new(ExitState {
                    finished: true,
                    ..ExitState::default()
                }),
                exit_cv: Condvar::new(),
                batcher: OutputBatcher::new(max_pending_bytes),
                handler: Arc::new(handler),
            }),
            shell,
            read_chunk_size: read_chunk_size.max(64),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Child process id while running
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.handle).as_ref().and_then(|h| h.pid)
    }

    /// Spawn `shell -c command` on a fresh PTY.
    ///
    /// `TERM=xterm-256color` is always set, overriding `env`.
    #[instrument(skip(self, command, env), fields(shell = %self.shell, rows = rows, cols = cols))]
    pub fn start(
        &self,
        command: &str,
        env: &[(String, String)],
        working_dir: &Path,
        rows: u16,
        cols: u16,
    ) -> PtyResult<()> {
        let mut slot = lock(&self.inner.handle);
        if slot.is_some() {
            return Err(PtyError::AlreadyRunning);
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| {
                error!(error = %e, "Failed to open PTY");
                PtyError::SpawnFailed {
                    reason: format!("Failed to open PTY: {e}"),
                }
            })?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-c");
        cmd.arg(command);
        cmd.cwd(working_dir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(error = %e, "Failed to spawn shell command");
            PtyError::SpawnFailed {
                reason: format!("Failed to spawn command: {e}"),
            }
        })?;
        // Drop the slave so EOF is seen once the child exits
        drop(pair.slave);

        let attach = || -> PtyResult<(Box<dyn Read + Send>, Box<dyn Write + Send>, RawFd)> {
            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| PtyError::SpawnFailed {
                    reason: e.to_string(),
                })?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| PtyError::SpawnFailed {
                    reason: e.to_string(),
                })?;
            let fd = pair.master.as_raw_fd().ok_or_else(|| PtyError::SpawnFailed {
                reason: "PTY master has no file descriptor".to_string(),
            })?;
            // SAFETY: the master owning `fd` outlives this borrow.
            set_nonblocking(unsafe { BorrowedFd::borrow_raw(fd) })?;
            Ok((reader, writer, fd))
        };
        let (reader, writer, master_fd) = match attach() {
            Ok(parts) => parts,
            Err(e) => {
                let _ = child.kill();
                return Err(e);
            }
        };

        let (wake_rx, wake_tx) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::Io(e));
            }
        };

        {
            let mut exit = lock(&self.inner.exit);
            *exit = ExitState::default();
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let context = ReaderContext {
            inner: Arc::clone(&self.inner),
            reader,
            master_fd,
            wake: wake_rx,
            chunk_size: self.read_chunk_size,
        };
        let reader_thread = match thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || context.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                lock(&self.inner.exit).finished = true;
                let _ = child.kill();
                return Err(PtyError::SpawnFailed {
                    reason: format!("Failed to start reader thread: {e}"),
                });
            }
        };

        let pid = child.process_id();
        info!(pid = ?pid, "PTY process started");
        *slot = Some(PtyHandle {
            master: pair.master,
            writer,
            child,
            master_fd,
            pid,
            wake: wake_tx,
            reader_thread_id: reader_thread.thread().id(),
            reader_thread: Some(reader_thread),
        });
        Ok(())
    }

    /// Write raw bytes to the child. Silently ignored when not running.
    pub fn write(&self, data: &[u8]) {
        let mut slot = lock(&self.inner.handle);
        let Some(handle) = slot.as_mut() else {
            trace!(bytes = data.len(), "Write ignored, PTY not running");
            return;
        };
        trace!(bytes = data.len(), "PTY write");
        if let Err(e) = write_all_nonblocking(&mut handle.writer, handle.master_fd, data) {
            // A dead child surfaces as EOF on the read side.
            warn!(error = %e, "PTY write failed");
        }
    }

    /// Update the terminal window size. No-op when not running.
    #[instrument(skip(self))]
    pub fn resize(&self, rows: u16, cols: u16) -> PtyResult<()> {
        let slot = lock(&self.inner.handle);
        let Some(handle) = slot.as_ref() else {
            return Ok(());
        };
        debug!("Resizing PTY");
        handle
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    /// Send `signal` to the terminal's foreground process group, falling
    /// back to the child's own group.
    pub fn signal(&self, signal: Signal) -> PtyResult<()> {
        let slot = lock(&self.inner.handle);
        let handle = slot.as_ref().ok_or(PtyError::NotRunning)?;
        let group = handle
            .master
            .process_group_leader()
            .filter(|pgid| *pgid > 0)
            .or(handle.pid.map(|pid| pid as i32))
            .ok_or(PtyError::NotRunning)?;
        debug!(pgid = group, signal = ?signal, "Signalling PTY process group");
        match killpg(Pid::from_raw(group), signal) {
            Ok(()) => Ok(()),
            // Group leader gone; fall back to the child itself
            Err(Errno::ESRCH) => match handle.pid {
                Some(pid) => kill(Pid::from_raw(pid as i32), signal).map_err(PtyError::from),
                None => Err(PtyError::NotRunning),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// SIGINT to the foreground job
    pub fn interrupt(&self) -> PtyResult<()> {
        self.signal(Signal::SIGINT)
    }

    /// Stop the child and release every resource. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub fn terminate(&self) {
        if !self.inner.shutdown(Some("terminated".to_string())) {
            trace!("Terminate ignored, PTY already stopped");
        }
    }

    /// Exit status if the child has already been reaped
    pub fn try_exit_code(&self) -> Option<u32> {
        {
            let mut slot = lock(&self.inner.handle);
            if let Some(handle) = slot.as_mut() {
                return match handle.child.try_wait() {
                    Ok(Some(status)) => Some(status.exit_code()),
                    _ => None,
                };
            }
        }
        lock(&self.inner.exit).exit_code
    }

    /// Block until the process has stopped and been reaped; returns its exit
    /// status. Must not be called from the event handler.
    pub fn wait_for_exit(&self) -> Option<u32> {
        let lingering = {
            let mut exit = lock(&self.inner.exit);
            while !exit.finished {
                exit = self
                    .inner
                    .exit_cv
                    .wait(exit)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            match exit.lingering.take() {
                Some(child) => child,
                None => return exit.exit_code,
            }
        };

        let mut child = lingering;
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                warn!(error = %e, "Failed to wait for PTY child");
                None
            }
        };
        lock(&self.inner.exit).exit_code = code;
        code
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.inner.shutdown(Some("dropped".to_string()));
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("shell", &self.shell)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reader thread
// ============================================================================

struct ReaderContext {
    inner: Arc<PtyInner>,
    reader: Box<dyn Read + Send>,
    master_fd: RawFd,
    wake: UnixStream,
    chunk_size: usize,
}

enum DrainOutcome {
    /// Nothing more to read right now
    Idle,
    /// EOF or a fatal read error
    Closed(Option<String>),
}

impl ReaderContext {
    fn run(mut self) {
        debug!(fd = self.master_fd, "PTY reader started");
        let mut buf = vec![0u8; self.chunk_size];

        let reason = loop {
            // SAFETY: the master fd stays open until this thread has been
            // joined or has itself run the teardown.
            let master = unsafe { BorrowedFd::borrow_raw(self.master_fd) };
            let mut fds = [
                PollFd::new(master, PollFlags::POLLIN),
                PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => break Some(format!("poll failed: {e}")),
            }

            if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                trace!("PTY reader cancelled");
                return;
            }
            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                if let DrainOutcome::Closed(reason) = self.drain(&mut buf) {
                    break reason;
                }
            }
        };

        debug!(reason = ?reason, "PTY output closed");
        self.inner.shutdown(reason);
    }

    /// Read until the fd would block, so one readiness event never leaves
    /// data behind.
    fn drain(&mut self, buf: &mut [u8]) -> DrainOutcome {
        loop {
            match self.reader.read(buf) {
                Ok(0) => return DrainOutcome::Closed(None),
                Ok(n) => {
                    trace!(bytes = n, "PTY read");
                    self.inner.deliver(&buf[..n]);
                    if n < buf.len() {
                        return DrainOutcome::Idle;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DrainOutcome::Idle,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => return DrainOutcome::Closed(None),
                Err(e) => return DrainOutcome::Closed(Some(e.to_string())),
            }
        }
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> PtyResult<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
    Ok(())
}

/// `write_all` over a non-blocking fd, waiting for writability on
/// `EAGAIN` for at most [`WRITE_STALL_LIMIT`].
fn write_all_nonblocking(writer: &mut dyn Write, fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    let started = Instant::now();
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "PTY write returned 0")),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let waited = started.elapsed();
                if waited >= WRITE_STALL_LIMIT {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "PTY input stalled"));
                }
                let remaining = (WRITE_STALL_LIMIT - waited).as_millis().min(u16::MAX as u128) as u16;
                // SAFETY: the fd belongs to the handle borrowed by the caller.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLOUT)];
                match poll(&mut fds, PollTimeout::from(remaining)) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(io::Error::from(e)),
                }
            }
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}
