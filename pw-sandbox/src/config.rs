//! Sandbox configuration: resource limits for script runs.
//!
//! Limits come from three layers, later layers winning:
//!
//! 1. built-in defaults ([`SandboxConfig::default`]),
//! 2. a config file ([`SandboxConfig::load_str`] / [`SandboxConfig::load_file`]),
//! 3. `PW_SANDBOX_*` environment variables ([`SandboxConfig::apply_env`]).
//!
//! The config file format is line oriented:
//!
//! | Line | Action |
//! |------|--------|
//! | `instruction_limit = 5000000` | VM instruction budget |
//! | `memory_limit = 8388608` | Lua heap limit in bytes |
//! | `timeout_ms = 2000` | wall-clock budget |
//! | `/set <name>=<value>` | same as `<name> = <value>` |
//! | Lines starting with `;` or `#` | comment, ignored |
//!
//! A value of `0`, `off` or `none` disables that limit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Environment variable overriding [`SandboxConfig::instruction_limit`].
pub const ENV_INSTRUCTION_LIMIT: &str = "PW_SANDBOX_INSTRUCTION_LIMIT";
/// Environment variable overriding [`SandboxConfig::memory_limit`].
pub const ENV_MEMORY_LIMIT: &str = "PW_SANDBOX_MEMORY_LIMIT";
/// Environment variable overriding [`SandboxConfig::timeout`] (milliseconds).
pub const ENV_TIMEOUT_MS: &str = "PW_SANDBOX_TIMEOUT_MS";

// ── Public API ────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading configuration.
///
/// `line` is 0 for errors that did not come from a file (environment
/// overrides).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

/// Resource limits applied to every sandboxed script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Abort after this many VM instructions.
    pub instruction_limit: Option<u64>,
    /// Lua heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Wall-clock budget for one run.
    pub timeout: Option<Duration>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            instruction_limit: Some(10_000_000),
            memory_limit: Some(16 * 1024 * 1024),
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl SandboxConfig {
    /// A configuration with every limit disabled.
    pub fn unlimited() -> Self {
        Self { instruction_limit: None, memory_limit: None, timeout: None }
    }

    /// Defaults with `PW_SANDBOX_*` overrides applied.
    ///
    /// Malformed overrides are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for err in config.apply_env(|name| std::env::var(name).ok()) {
            tracing::warn!("ignoring sandbox override: {}", err.message);
        }
        config
    }

    /// Parse a config string on top of the defaults.
    ///
    /// Unknown keys and bad values are reported per line; the remaining lines
    /// still apply.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = Self::default();
        let errors = config.merge_str(s);
        (config, errors)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    /// Apply the settings in `s` to `self`, returning per-line errors.
    pub fn merge_str(&mut self, s: &str) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            // `/set name=value` is accepted as an alias for `name = value`.
            let body = match line.strip_prefix("/set") {
                Some(rest) if rest.starts_with(|c: char| c.is_ascii_whitespace()) => rest.trim(),
                _ => line,
            };

            let Some((name, value)) = body.split_once('=') else {
                errors.push(ConfigError {
                    line: lineno,
                    message: format!("expected `name = value`, got `{line}`"),
                });
                continue;
            };

            if let Err(message) = self.set(name.trim(), value.trim()) {
                errors.push(ConfigError { line: lineno, message });
            }
        }

        errors
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        for (var, key) in [
            (ENV_INSTRUCTION_LIMIT, "instruction_limit"),
            (ENV_MEMORY_LIMIT, "memory_limit"),
            (ENV_TIMEOUT_MS, "timeout_ms"),
        ] {
            if let Some(value) = lookup(var) {
                if let Err(message) = self.set(key, value.trim()) {
                    errors.push(ConfigError { line: 0, message: format!("{var}: {message}") });
                }
            }
        }
        errors
    }

    /// Set a single named limit from its textual value.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        match name {
            "instruction_limit" => self.instruction_limit = parse_limit(name, value)?,
            "memory_limit" => {
                self.memory_limit = parse_limit(name, value)?
                    .map(usize::try_from)
                    .transpose()
                    .map_err(|_| format!("{name}: value too large: {value}"))?;
            }
            "timeout_ms" => self.timeout = parse_limit(name, value)?.map(Duration::from_millis),
            _ => return Err(format!("unknown setting: {name}")),
        }
        Ok(())
    }
}

/// Location of the per-user config file, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "pw-sandbox").map(|d| d.config_dir().join("config"))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_limit(name: &str, value: &str) -> Result<Option<u64>, String> {
    match value {
        "0" | "off" | "none" => Ok(None),
        v => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("{name}: expected a non-negative integer, got `{v}`")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
