//! Configuration management for termsession
//!
//! Configuration is assembled from:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/termsession/config.toml (or platform-specific location)
//! 3. Project-local config at ./.termsession/config.toml
//!
//! A section present in a later file replaces the same section from earlier
//! ones; fields it leaves out take their defaults.

use crate::error::{ConfigError, ConfigResult};
use crate::terminal::prompt::default_prompt_glyphs;
use crate::terminal::pty::{default_shell, DEFAULT_MAX_PENDING_BYTES, DEFAULT_READ_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

const APP_DIR: &str = "termsession";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shell selection and extra environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ShellConfig {
    /// Configured program, else `$SHELL`, else `/bin/sh`
    pub fn resolve_program(&self) -> String {
        self.program
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| shellexpand::tilde(p).into_owned())
            .unwrap_or_else(default_shell)
    }

    /// Extra environment as sorted pairs
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

/// Pseudo-terminal settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtyConfig {
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            max_pending_bytes: default_max_pending_bytes(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

/// Input routing and prompt detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_prompt_window")]
    pub prompt_window: usize,
    #[serde(default = "default_prompt_glyphs")]
    pub prompt_glyphs: Vec<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            prompt_window: default_prompt_window(),
            prompt_glyphs: default_prompt_glyphs(),
        }
    }
}

/// Session plumbing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    #[serde(default = "default_container_program")]
    pub container_program: String,
}

impl SessionConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            event_capacity: default_event_capacity(),
            ssh_program: default_ssh_program(),
            container_program: default_container_program(),
        }
    }
}

/// Logging settings (see [`crate::logging`])
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default)]
    pub file_line: bool,
    #[serde(default)]
    pub file_output: bool,
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            file_line: false,
            file_output: false,
            file_path: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_max_pending_bytes() -> usize {
    DEFAULT_MAX_PENDING_BYTES
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_history_limit() -> usize {
    500
}

fn default_prompt_window() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    16
}

fn default_event_capacity() -> usize {
    256
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_container_program() -> String {
    "docker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Configuration loading
// ============================================================================

impl AppConfig {
    /// Load configuration with fallback chain:
    /// 1. Embedded default_config.toml
    /// 2. User config ~/.config/termsession/config.toml
    /// 3. Project-local .termsession/config.toml
    pub fn load() -> ConfigResult<Self> {
        let layers = [Self::user_config_path(), Self::project_config_path()];
        Self::load_layers(layers.iter().flatten().map(PathBuf::as_path))
    }

    /// Embedded defaults overlaid with each existing file in order.
    /// Unreadable or malformed files are skipped with a warning.
    pub fn load_layers<'a>(paths: impl IntoIterator<Item = &'a Path>) -> ConfigResult<Self> {
        let mut merged = parse_table(DEFAULT_CONFIG).map_err(|e| {
            ConfigError::Parse(format!("Failed to parse default config: {}", e))
        })?;

        for path in paths {
            if !path.exists() {
                continue;
            }
            match read_table(path) {
                Ok(overlay) => {
                    merge_sections(&mut merged, overlay);
                    tracing::info!("Loaded config from {:?}", path);
                }
                Err(e) => {
                    tracing::warn!("Skipping config {:?}: {}", path, e);
                }
            }
        }

        Self::deserialize(toml::Value::Table(merged)).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from a specific file (on top of field defaults)
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| {
            ConfigError::Parse(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get the user config path (~/.config/termsession/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join(APP_DIR).join("config.toml"))
    }

    /// Get the project-local config path (./.termsession/config.toml)
    pub fn project_config_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(format!(".{APP_DIR}")).join("config.toml"))
    }

    /// Save configuration to the user config path
    pub fn save(&self) -> ConfigResult<()> {
        let config_path = Self::user_config_path().ok_or_else(|| {
            ConfigError::Io("Could not determine user config directory".to_string())
        })?;
        self.save_to(&config_path)
    }

    /// Write configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, toml_string).map_err(|e| ConfigError::Io(e.to_string()))?;
        tracing::debug!("Saved config to {:?}", path);
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            shell: ShellConfig::default(),
            pty: PtyConfig::default(),
            input: InputConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        })
    }
}

fn parse_table(contents: &str) -> Result<toml::Table, toml::de::Error> {
    contents.parse::<toml::Table>()
}

fn read_table(path: &Path) -> ConfigResult<toml::Table> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    parse_table(&contents)
        .map_err(|e| ConfigError::Parse(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Whole-section replacement: every top-level key in `overlay` wins
fn merge_sections(base: &mut toml::Table, overlay: toml::Table) {
    for (section, value) in overlay {
        base.insert(section, value);
    }
}
