//! `termsession` Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use thiserror::Error;

/// Top-level error type for `termsession`
#[derive(Error, Debug)]
pub enum TermError {
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// PTY-related errors
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to spawn PTY: {reason}")]
    SpawnFailed { reason: String },

    #[error("PTY process is already running")]
    AlreadyRunning,

    #[error("PTY process is not running")]
    NotRunning,

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),
}

/// Session-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),

    #[error("Session is no longer usable (state: {state})")]
    Terminated { state: String },

    #[error("Command '{command}' failed to run: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),
}

/// Result type alias for `termsession` operations
pub type Result<T> = std::result::Result<T, TermError>;

/// Result type alias for PTY operations
pub type PtyResult<T> = std::result::Result<T, PtyError>;

/// Result type alias for Session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Result type alias for Config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
