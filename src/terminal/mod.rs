//! Terminal module for termsession
//!
//! PTY process management, escape decoding, line assembly, prompt detection
//! and keystroke routing.

pub mod ansi;
pub mod input;
pub mod line_buffer;
pub mod prompt;
pub mod pty;

pub use ansi::{decode, strip_ansi, Color, DecodedText, StyleState, StyledRun};
pub use input::{CommandHistory, InputService, InputSink, Key, KeyOutcome};
pub use line_buffer::{BufferSnapshot, LineBuffer, OutputLine};
pub use prompt::{Detection, InputMode, PromptDetector};
pub use pty::{OutputBatcher, PtyEvent, PtyProcess, Utf8Stream};
