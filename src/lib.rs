//! termsession library
//!
//! Terminal session I/O engine:
//! - PTY (Pseudo-Terminal) process management with non-blocking reads
//! - ANSI escape decoding into styled runs
//! - Line assembly with carriage-return overwrite semantics
//! - Prompt detection and mode-aware keystroke routing
//! - Local, ssh and container sessions behind one contract

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod terminal;

pub use error::{Result, TermError};
