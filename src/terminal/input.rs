//! Keystroke routing
//!
//! Buffers or forwards user input depending on the current [`InputMode`],
//! keeps a capped history of submitted commands and writes the resulting
//! bytes into an [`InputSink`]. Sessions collect them in a `Vec<u8>` and
//! write to the PTY once the service is unlocked.

use crate::terminal::prompt::{Detection, InputMode};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Default number of remembered commands
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

const ETX: u8 = 0x03; // Ctrl-C
const EOT: u8 = 0x04; // Ctrl-D
const TAB: u8 = b'\t';
const DEL: u8 = 0x7f;
const ARROW_UP: &[u8] = b"\x1b[A";
const ARROW_DOWN: &[u8] = b"\x1b[B";

/// Destination for bytes produced by the input service.
///
/// Writes are fire-and-forget: a broken child shows up later as EOF on the
/// output side.
pub trait InputSink: Send {
    fn send(&mut self, bytes: &[u8]);
}

impl InputSink for Vec<u8> {
    fn send(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Keys the input service understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    /// Shift-Enter: literal newline inside a multiline buffer
    Newline,
    Tab,
    Backspace,
    CtrlC,
    CtrlD,
    ArrowUp,
    ArrowDown,
}

/// What a keystroke did, for callers tracking session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Buffered, forwarded or ignored; nothing to report
    Handled,
    /// A line was sent. `text` is empty for password submissions.
    Submitted { text: String, mode: InputMode },
    /// Ctrl-C was sent and the mode was forced back to normal
    Interrupted,
}

/// Capped list of submitted commands with up/down navigation
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    limit: usize,
    /// Index of the entry shown in the buffer while navigating
    cursor: Option<usize>,
}

impl CommandHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            limit: limit.max(1),
            cursor: None,
        }
    }

    /// Record a command; empty lines and immediate repeats are skipped
    pub fn push(&mut self, command: &str) {
        self.cursor = None;
        if command.trim().is_empty() {
            return;
        }
        if self.entries.back().is_some_and(|last| last == command) {
            return;
        }
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(command.to_string());
    }

    /// Step towards older entries
    pub fn older(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let index = match self.cursor {
            None => self.entries.len() - 1,
            Some(i) => i.saturating_sub(1),
        };
        self.cursor = Some(index);
        self.entries.get(index).map(String::as_str)
    }

    /// Step towards newer entries; `None` once past the most recent one
    pub fn newer(&mut self) -> Option<&str> {
        let current = self.cursor?;
        if current + 1 >= self.entries.len() {
            self.cursor = None;
            return None;
        }
        self.cursor = Some(current + 1);
        self.entries.get(current + 1).map(String::as_str)
    }

    /// Whether up/down navigation is in progress
    pub fn is_navigating(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mode-aware keystroke handler for one session
#[derive(Debug)]
pub struct InputService<S: InputSink> {
    sink: S,
    mode: InputMode,
    prompt_label: Option<String>,
    buffer: String,
    history: CommandHistory,
}

impl<S: InputSink> InputService<S> {
    pub fn new(sink: S, history_limit: usize) -> Self {
        Self {
            sink,
            mode: InputMode::Normal,
            prompt_label: None,
            buffer: String::new(),
            history: CommandHistory::new(history_limit),
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Label of the prompt that put the service into its current mode
    pub fn prompt_label(&self) -> Option<&str> {
        self.prompt_label.as_deref()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            debug!(from = %self.mode, to = %mode, "Input mode changed");
            self.mode = mode;
        }
        if mode == InputMode::Normal {
            self.prompt_label = None;
        }
    }

    /// Apply a prompt detector result. Returns true when the mode changed.
    pub fn apply_detection(&mut self, detection: &Detection) -> bool {
        let before = self.mode;
        match detection {
            Detection::Prompt { mode, label } => {
                self.set_mode(*mode);
                self.prompt_label = Some(label.clone());
            }
            Detection::ShellPrompt => {
                if self.mode.is_elevated() {
                    self.set_mode(InputMode::Normal);
                }
            }
        }
        before != self.mode
    }

    /// Drop buffered input and return to normal mode without sending anything
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.set_mode(InputMode::Normal);
    }

    /// Raw local buffer
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Buffer as it may be shown; password input is masked
    pub fn display_buffer(&self) -> String {
        match self.mode {
            InputMode::Password => "•".repeat(self.buffer.chars().count()),
            _ => self.buffer.clone(),
        }
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Type a single character
    pub fn send_character(&mut self, c: char) -> KeyOutcome {
        self.handle_key(Key::Char(c))
    }

    /// Press Enter on whatever is buffered
    pub fn submit_current_input(&mut self) -> KeyOutcome {
        self.handle_key(Key::Enter)
    }

    /// Replace the buffer with `text` and submit it
    pub fn send_input(&mut self, text: &str) -> KeyOutcome {
        if self.mode == InputMode::Interactive {
            self.sink.send(text.as_bytes());
        } else {
            self.buffer = text.to_string();
        }
        self.submit()
    }

    /// Forward raw bytes (escape sequences, control codes) untouched
    pub fn send_control_sequence(&mut self, bytes: &[u8]) {
        trace!(bytes = bytes.len(), "Forwarding control sequence");
        self.sink.send(bytes);
    }

    pub fn handle_key(&mut self, key: Key) -> KeyOutcome {
        match key {
            Key::Char(c) => {
                if self.mode == InputMode::Interactive {
                    let mut utf8 = [0u8; 4];
                    self.sink.send(c.encode_utf8(&mut utf8).as_bytes());
                } else {
                    self.buffer.push(c);
                }
                KeyOutcome::Handled
            }
            Key::Enter => self.submit(),
            Key::Newline => {
                if self.mode == InputMode::Multiline {
                    self.buffer.push('\n');
                }
                KeyOutcome::Handled
            }
            Key::Tab => {
                if self.mode == InputMode::Normal {
                    self.sink.send(&[TAB]);
                }
                KeyOutcome::Handled
            }
            Key::Backspace => {
                self.buffer.pop();
                if matches!(self.mode, InputMode::Normal | InputMode::Interactive) {
                    self.sink.send(&[DEL]);
                }
                KeyOutcome::Handled
            }
            Key::CtrlC => {
                self.sink.send(&[ETX]);
                self.buffer.clear();
                self.set_mode(InputMode::Normal);
                KeyOutcome::Interrupted
            }
            Key::CtrlD => {
                self.sink.send(&[EOT]);
                KeyOutcome::Handled
            }
            Key::ArrowUp => {
                match self.mode {
                    InputMode::Normal => {
                        if let Some(entry) = self.history.older() {
                            self.buffer = entry.to_string();
                        }
                    }
                    InputMode::Interactive => self.sink.send(ARROW_UP),
                    InputMode::Password | InputMode::Multiline => {}
                }
                KeyOutcome::Handled
            }
            Key::ArrowDown => {
                match self.mode {
                    InputMode::Normal => {
                        if self.history.is_navigating() {
                            self.buffer = self.history.newer().map(str::to_string).unwrap_or_default();
                        }
                    }
                    InputMode::Interactive => self.sink.send(ARROW_DOWN),
                    InputMode::Password | InputMode::Multiline => {}
                }
                KeyOutcome::Handled
            }
        }
    }

    fn submit(&mut self) -> KeyOutcome {
        let line = std::mem::take(&mut self.buffer);
        let mode = self.mode;

        match mode {
            InputMode::Interactive => {
                self.sink.send(b"\n");
            }
            InputMode::Normal | InputMode::Multiline | InputMode::Password => {
                let mut bytes = Vec::with_capacity(line.len() + 1);
                bytes.extend_from_slice(line.as_bytes());
                bytes.push(b'\n');
                self.sink.send(&bytes);
            }
        }

        match mode {
            InputMode::Normal => {
                debug!(command = %line, "Submitted command");
                self.history.push(&line);
                KeyOutcome::Submitted { text: line, mode }
            }
            InputMode::Password => {
                debug!("Submitted password input");
                // One secret per prompt; a retry prompt re-enters password mode.
                self.set_mode(InputMode::Normal);
                KeyOutcome::Submitted {
                    text: String::new(),
                    mode,
                }
            }
            InputMode::Interactive | InputMode::Multiline => {
                trace!(mode = %mode, "Submitted input");
                KeyOutcome::Submitted { text: line, mode }
            }
        }
    }
}
