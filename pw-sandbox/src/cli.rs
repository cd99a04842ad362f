//! Command-line argument parsing and input loading for the `pw-sandbox` binary.
//!
//! Usage:
//!   pw-sandbox [-e<envs.json>] [-c<config> | -f] [-i<n>] [-m<bytes>] [-t<ms>] [-pd] [<script.lua> | -]

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::{default_config_path, SandboxConfig};
use crate::env::Envs;

pub const USAGE: &str =
    "Usage: pw-sandbox [-e<envs.json>] [-c<config> | -f] [-i<n>] [-m<bytes>] [-t<ms>] [-pd] [<script.lua> | -]";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Envs JSON document (`-e<file>`); empty envs when absent.
    pub envs_file: Option<PathBuf>,
    /// Which config file to load.
    pub config: ConfigFile,
    /// Limit overrides from `-i`, `-m`, `-t`, as `(setting, value)` pairs.
    pub overrides: Vec<(&'static str, String)>,
    /// Pretty-print the resulting JSON (`-p`).
    pub pretty: bool,
    /// Debug logging (`-d`).
    pub debug: bool,
    /// Where the script comes from.
    pub script: ScriptSource,
}

/// How to choose the config file.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum ConfigFile {
    /// Use the per-user config file if it exists (default).
    #[default]
    Search,
    /// `-f`: use built-in defaults only.
    Skip,
    /// `-c<file>`: load this specific file.
    Explicit(PathBuf),
}

/// Where to read the script from.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum ScriptSource {
    /// No positional argument, or `-`.
    #[default]
    Stdin,
    File(PathBuf),
}

/// Errors surfaced by the command-line front end.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading script from stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("{}: invalid envs JSON: {source}", .path.display())]
    Envs {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding result: {0}")]
    Encode(#[from] serde_json::Error),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut positional: Vec<String> = Vec::new();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        // `--` ends flag processing.
        if arg == "--" {
            i += 1;
            positional.extend(argv[i..].iter().cloned());
            break;
        }

        // Non-flag argument (`-` alone means stdin).
        if !arg.starts_with('-') || arg == "-" {
            positional.push(arg.to_owned());
            i += 1;
            continue;
        }

        // Flag argument: iterate over characters after the leading `-`.
        let chars: Vec<char> = arg[1..].chars().collect();
        let mut j = 0;
        while j < chars.len() {
            match chars[j] {
                'd' => args.debug = true,
                'p' => args.pretty = true,
                'f' => args.config = ConfigFile::Skip,

                // Flags taking a value, embedded (`-e<file>`) or separate (`-e <file>`).
                flag @ ('e' | 'c' | 'i' | 'm' | 't') => {
                    let value = if j + 1 < chars.len() {
                        let s: String = chars[j + 1..].iter().collect();
                        j = chars.len();
                        s
                    } else if i + 1 < argv.len() {
                        i += 1;
                        argv[i].clone()
                    } else {
                        return Err(format!("-{flag} requires an argument"));
                    };
                    match flag {
                        'e' => args.envs_file = Some(PathBuf::from(value)),
                        'c' => args.config = ConfigFile::Explicit(PathBuf::from(value)),
                        _ => {
                            let setting = match flag {
                                'i' => "instruction_limit",
                                'm' => "memory_limit",
                                _ => "timeout_ms",
                            };
                            if value.parse::<u64>().is_err() {
                                return Err(format!("-{flag}: invalid number: {value}"));
                            }
                            args.overrides.push((setting, value));
                        }
                    }
                }

                c => return Err(format!("unknown option: -{c}")),
            }
            j += 1;
        }
        i += 1;
    }

    match positional.len() {
        0 => {}
        1 => {
            let p = positional.remove(0);
            if p != "-" {
                args.script = ScriptSource::File(PathBuf::from(p));
            }
        }
        n => return Err(format!("too many arguments ({n})")),
    }

    Ok(args)
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Build the sandbox configuration: defaults, then config file, then
/// environment overrides, then command-line overrides.
///
/// Problems in the config file and environment are logged, not fatal.
pub fn load_config(args: &CliArgs) -> Result<SandboxConfig, CliError> {
    let path = match &args.config {
        ConfigFile::Skip => None,
        ConfigFile::Explicit(p) => Some(p.clone()),
        ConfigFile::Search => find_user_config(),
    };

    let mut config = match &path {
        Some(p) => {
            let (config, errors) = SandboxConfig::load_file(p)
                .map_err(|source| CliError::Io { path: p.clone(), source })?;
            for e in errors {
                tracing::warn!("{}: {e}", p.display());
            }
            config
        }
        None => SandboxConfig::default(),
    };

    for e in config.apply_env(|name| std::env::var(name).ok()) {
        tracing::warn!("ignoring sandbox override: {}", e.message);
    }

    // Values were validated while parsing.
    for (setting, value) in &args.overrides {
        if let Err(e) = config.set(setting, value) {
            tracing::warn!("ignoring {setting} override: {e}");
        }
    }

    Ok(config)
}

/// Read the script text.
pub async fn read_script(source: &ScriptSource) -> Result<String, CliError> {
    match source {
        ScriptSource::Stdin => {
            let mut s = String::new();
            tokio::io::stdin().read_to_string(&mut s).await.map_err(CliError::Stdin)?;
            Ok(s)
        }
        ScriptSource::File(path) => read_file(path).await,
    }
}

/// Read the envs document, or empty envs when none was given.
pub async fn read_envs(path: Option<&Path>) -> Result<Envs, CliError> {
    let Some(path) = path else {
        return Ok(Envs::default());
    };
    let text = read_file(path).await?;
    serde_json::from_str(&text).map_err(|source| CliError::Envs { path: path.to_owned(), source })
}

/// Render the resulting envs as JSON.
pub fn render_envs(envs: &Envs, pretty: bool) -> Result<String, CliError> {
    let s = if pretty { serde_json::to_string_pretty(envs)? } else { serde_json::to_string(envs)? };
    Ok(s)
}

/// The per-user config file, if it exists.
pub fn find_user_config() -> Option<PathBuf> {
    default_config_path().filter(|p| p.exists())
}

async fn read_file(path: &Path) -> Result<String, CliError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CliError::Io { path: path.to_owned(), source })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
