//! Line Buffer
//!
//! Turns the raw PTY text stream into discrete styled lines. Newlines commit
//! lines; carriage returns commit an in-place line that later output
//! overwrites (progress bars). A consumer on another thread drains committed
//! lines with [`LineBuffer::flush`].

use crate::terminal::ansi::{decode, StyleState, StyledRun};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One rendered terminal line
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    /// Logical line number; a replacement keeps the id of the line it replaces
    pub id: u64,
    /// Plain text with escape sequences removed
    pub text: String,
    pub styled_runs: Vec<StyledRun>,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// Everything produced since the previous flush
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BufferSnapshot {
    pub lines: Vec<OutputLine>,
    /// The consumer's last rendered line must be overwritten by `lines[0]`
    pub replace_last: bool,
    pub has_new_content: bool,
    pub total_line_count: usize,
}

#[derive(Debug, Default)]
struct BufferState {
    /// Lines produced since the last flush
    lines: Vec<OutputLine>,
    /// Raw text of the line being accumulated
    segment: String,
    /// Style in effect at the start of `segment`
    segment_style: StyleState,
    /// `lines.last()` is a partial line that the next emit replaces
    partial_pending: bool,
    /// The last flush ended on a partial line the consumer has rendered
    partial_delivered: bool,
    /// A partial exists for the current logical line, pending or delivered
    line_open: bool,
    /// Previous character was `\r`
    after_cr: bool,
    total_lines: usize,
}

impl BufferState {
    fn emit(&mut self, text_source: DecodedSource, is_error: bool, partial: bool) {
        let decoded = match text_source {
            DecodedSource::Commit => decode(&self.segment, &mut self.segment_style),
            DecodedSource::Preview => {
                let mut style = self.segment_style;
                decode(&self.segment, &mut style)
            }
        };

        let id = if self.line_open {
            if self.partial_pending {
                self.lines.pop();
            }
            (self.total_lines as u64).saturating_sub(1)
        } else {
            self.total_lines += 1;
            (self.total_lines - 1) as u64
        };

        self.lines.push(OutputLine {
            id,
            text: decoded.text,
            styled_runs: decoded.runs,
            is_error,
            timestamp: Utc::now(),
        });
        self.partial_pending = partial;
        self.line_open = partial;
    }

    /// Turn the open in-place line into a finished one without changing its text
    fn close_open_line(&mut self) {
        self.partial_pending = false;
        self.line_open = false;
        if self.lines.is_empty() {
            // Already rendered by the consumer; nothing left to replace.
            self.partial_delivered = false;
        }
    }
}

enum DecodedSource {
    /// Decode and advance the stream style
    Commit,
    /// Decode against a copy; the segment is still growing
    Preview,
}

/// Thread-safe accumulator between the PTY reader and an output consumer
#[derive(Debug, Default)]
pub struct LineBuffer {
    state: Mutex<BufferState>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed decoded PTY text
    pub fn append(&self, text: &str, is_error: bool) {
        if text.is_empty() {
            return;
        }
        let mut state = self.lock();

        for c in text.chars() {
            match c {
                '\n' => {
                    if state.after_cr && state.segment.is_empty() && state.line_open {
                        // CRLF: the `\r` already committed this line in place
                        state.close_open_line();
                    } else {
                        state.emit(DecodedSource::Commit, is_error, false);
                        state.segment.clear();
                    }
                    state.after_cr = false;
                }
                '\r' => {
                    // A bare `\r` over an already committed in-place line keeps it
                    if !(state.segment.is_empty() && state.line_open) {
                        state.emit(DecodedSource::Commit, is_error, true);
                        state.segment.clear();
                    }
                    state.after_cr = true;
                }
                other => {
                    state.segment.push(other);
                    state.after_cr = false;
                }
            }
        }

        if !state.segment.is_empty() {
            state.emit(DecodedSource::Preview, is_error, true);
        }
    }

    /// Take every line produced since the previous flush
    pub fn flush(&self) -> BufferSnapshot {
        let mut state = self.lock();

        let lines = std::mem::take(&mut state.lines);
        let has_new_content = !lines.is_empty();
        let replace_last = has_new_content && state.partial_delivered;
        if has_new_content {
            state.partial_delivered = state.partial_pending;
        }
        state.partial_pending = false;

        BufferSnapshot {
            lines,
            replace_last,
            has_new_content,
            total_line_count: state.total_lines,
        }
    }

    /// Lines are waiting for the next flush
    pub fn has_pending_content(&self) -> bool {
        !self.lock().lines.is_empty()
    }

    /// Number of logical lines seen since creation or the last clear
    pub fn get_line_count(&self) -> usize {
        self.lock().total_lines
    }

    /// Drop all buffered lines, the open segment and the carried style
    pub fn clear(&self) {
        *self.lock() = BufferState::default();
    }
}
