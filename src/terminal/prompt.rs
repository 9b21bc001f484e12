//! Interactive prompt detection
//!
//! Watches the tail of the output stream for prompts that need special input
//! handling (passwords, confirmations, host-key checks, "press any key") and
//! for the shell prompt that signals control has returned to the shell.

use crate::terminal::ansi::strip_ansi;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Default size of the trailing output window, in characters
pub const DEFAULT_PROMPT_WINDOW: usize = 500;

/// How keystrokes are routed to the child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputMode {
    /// Line-buffered command input, recorded in history
    #[default]
    Normal,
    /// Every keystroke is sent immediately
    Interactive,
    /// Line-buffered, never echoed and never recorded
    Password,
    /// Line-buffered input that may contain newlines
    Multiline,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::Normal => "normal",
            InputMode::Interactive => "interactive",
            InputMode::Password => "password",
            InputMode::Multiline => "multiline",
        }
    }

    /// Anything other than normal command input
    pub fn is_elevated(&self) -> bool {
        *self != InputMode::Normal
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the prompt table
#[derive(Debug)]
pub struct PromptPattern {
    pub matcher: Regex,
    pub mode: InputMode,
    pub label: &'static str,
}

impl PromptPattern {
    fn new(pattern: &str, mode: InputMode, label: &'static str) -> Self {
        Self {
            matcher: Regex::new(pattern).unwrap(),
            mode,
            label,
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

/// Ordered prompt table; the first match wins.
///
/// Order: passwords, confirmations, SSH host verification, keypress waits.
pub static PROMPT_PATTERNS: Lazy<Vec<PromptPattern>> = Lazy::new(|| {
    vec![
        // Passwords and passphrases
        PromptPattern::new(
            r"(?i)\[sudo\] password for [^:\n]*:\s*$",
            InputMode::Password,
            "sudo password",
        ),
        PromptPattern::new(
            r"(?i)enter passphrase( for [^:\n]*)?:\s*$",
            InputMode::Password,
            "passphrase",
        ),
        PromptPattern::new(
            r"(?i)(^|[\s'\x22])[\w@.\-]*'?s? ?password[^:\n]{0,40}:\s*$",
            InputMode::Password,
            "password",
        ),
        PromptPattern::new(r"(?i)passphrase[^:\n]{0,40}:\s*$", InputMode::Password, "passphrase"),
        // Confirmations
        PromptPattern::new(
            r"(?i)\[(y/n|y/n/q|yes/no)\]\s*[?:]?\s*$",
            InputMode::Interactive,
            "confirmation",
        ),
        PromptPattern::new(
            r"(?i)\((y/n|yes/no)\)\s*[?:]?\s*$",
            InputMode::Interactive,
            "confirmation",
        ),
        PromptPattern::new(
            r"(?i)(do you want to continue|proceed|are you sure)\s*\?\s*$",
            InputMode::Interactive,
            "confirmation",
        ),
        // SSH host key verification
        PromptPattern::new(
            r"(?i)are you sure you want to continue connecting.*\?\s*$",
            InputMode::Interactive,
            "host verification",
        ),
        PromptPattern::new(
            r"(?i)\(yes/no/\[fingerprint\]\)\s*\?\s*$",
            InputMode::Interactive,
            "host verification",
        ),
        // Keypress waits
        PromptPattern::new(
            r"(?i)press (enter|return|any key)[^\n]*$",
            InputMode::Interactive,
            "keypress",
        ),
    ]
});

/// Outcome of inspecting new output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// An interactive prompt is waiting
    Prompt { mode: InputMode, label: String },
    /// The shell prompt is back; the foreground command has finished
    ShellPrompt,
}

/// Stateful classifier over a trailing window of raw output
#[derive(Debug)]
pub struct PromptDetector {
    window: String,
    capacity: usize,
    shell_prompt: Option<Regex>,
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_WINDOW, &default_prompt_glyphs())
    }
}

/// Glyphs that end a typical shell prompt
pub fn default_prompt_glyphs() -> Vec<String> {
    ["$", "#", "❯"].iter().map(|g| g.to_string()).collect()
}

fn shell_prompt_regex(glyphs: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = glyphs
        .iter()
        .filter(|g| !g.is_empty())
        .map(|g| regex::escape(g))
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    let pattern = format!(r"(?:{})\s*$", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid shell prompt glyphs, shell prompt detection disabled");
            None
        }
    }
}

impl PromptDetector {
    /// Create a detector keeping `capacity` characters of trailing output
    pub fn new(capacity: usize, prompt_glyphs: &[String]) -> Self {
        Self {
            window: String::with_capacity(capacity),
            capacity: capacity.max(1),
            shell_prompt: shell_prompt_regex(prompt_glyphs),
        }
    }

    /// Append a chunk of raw output and classify the new tail
    pub fn feed(&mut self, chunk: &str) -> Option<Detection> {
        if chunk.is_empty() {
            return None;
        }
        self.window.push_str(chunk);
        self.trim_window();
        self.classify()
    }

    /// Forget buffered output, e.g. after the user answered a prompt
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Raw trailing output currently held
    pub fn window(&self) -> &str {
        &self.window
    }

    fn trim_window(&mut self) {
        let len = self.window.chars().count();
        if len > self.capacity {
            let cut = self
                .window
                .char_indices()
                .nth(len - self.capacity)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.window.drain(..cut);
        }
    }

    fn classify(&self) -> Option<Detection> {
        let plain = strip_ansi(&self.window);
        // Prompts sit on the last line; earlier lines are history.
        let tail = plain
            .rsplit(|c: char| c == '\n' || c == '\r')
            .find(|line| !line.trim().is_empty())?;

        if let Some(pattern) = PROMPT_PATTERNS.iter().find(|p| p.matches(tail)) {
            return Some(Detection::Prompt {
                mode: pattern.mode,
                label: pattern.label.to_string(),
            });
        }

        if self.shell_prompt.as_ref().is_some_and(|re| re.is_match(tail)) {
            return Some(Detection::ShellPrompt);
        }
        None
    }
}
