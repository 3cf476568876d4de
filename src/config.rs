use chrono::TimeDelta;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::metadata::{sanitize_key, MetadataStore};

/// Default trailing window when neither the flag nor the config file sets one.
pub const DEFAULT_WINDOW: &str = "10m";
/// Default number of admitted launches allowed inside the window.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;
/// Default directory holding one `.meta` file per identity.
pub const DEFAULT_METADATA_DIR: &str = "/run/runlimit";

static DURATION_FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9]+(?:\.[0-9]+)?(?:ns|us|µs|ms|s|m|h))+$").unwrap()
});
static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)(?:\.([0-9]+))?(ns|us|µs|ms|s|m|h)").unwrap());

/// Optional settings loaded from a TOML file (`--config`).
///
/// Every field may be omitted; command-line flags take precedence.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub window_size: Option<String>,
    pub max_restarts: Option<u32>,
    pub metadata_dir: Option<PathBuf>,
    pub metadata_key: Option<String>,
    pub sv_cmd: Option<String>,
}

impl FileConfig {
    /// Load and parse a config file. A missing or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Raw, unvalidated settings gathered from the command line.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub window_size: Option<String>,
    pub max_restarts: Option<u32>,
    pub metadata_dir: Option<PathBuf>,
    pub metadata_key: Option<String>,
    pub sv_cmd: Option<String>,
}

/// Fully resolved, validated configuration for one invocation.
///
/// Built once at startup and handed by reference to the store, limiter and
/// stop orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    pub window: TimeDelta,
    pub max_restarts: u32,
    pub metadata_dir: PathBuf,
    pub metadata_key: String,
    /// Stop command already split into program + arguments.
    pub stop_command: Option<Vec<String>>,
}

impl LimitConfig {
    /// Merge defaults, file values and command-line overrides (in increasing
    /// precedence) and validate the result.
    ///
    /// `cwd` is only consulted when no metadata key was given.
    pub fn resolve(
        file: FileConfig,
        overrides: Overrides,
        cwd: &Path,
    ) -> Result<Self, ConfigError> {
        let window_text = overrides
            .window_size
            .or(file.window_size)
            .unwrap_or_else(|| DEFAULT_WINDOW.to_string());
        let window_std = parse_duration(&window_text)?;
        if window_std.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        let window =
            TimeDelta::from_std(window_std).map_err(|_| ConfigError::WindowOutOfRange {
                value: window_text.clone(),
            })?;

        let max_restarts = overrides
            .max_restarts
            .or(file.max_restarts)
            .unwrap_or(DEFAULT_MAX_RESTARTS);
        if max_restarts == 0 {
            return Err(ConfigError::ZeroMaxRestarts);
        }

        let metadata_dir = overrides
            .metadata_dir
            .or(file.metadata_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_METADATA_DIR));

        let metadata_key = match overrides.metadata_key.or(file.metadata_key) {
            Some(key) if key.is_empty() => return Err(ConfigError::EmptyMetadataKey),
            Some(key) => key,
            None => default_metadata_key(cwd),
        };

        let stop_command = match overrides.sv_cmd.or(file.sv_cmd) {
            Some(cmd) if !cmd.trim().is_empty() => Some(split_command(&cmd)?),
            _ => None,
        };

        Ok(Self {
            window,
            max_restarts,
            metadata_dir,
            metadata_key,
            stop_command,
        })
    }

    /// Path of the metadata document for this identity.
    pub fn metadata_path(&self) -> PathBuf {
        MetadataStore::new(&self.metadata_dir).path_for(&self.metadata_key)
    }
}

/// Key used when none is configured: the working directory, made file-name safe.
pub fn default_metadata_key(cwd: &Path) -> String {
    sanitize_key(&cwd.to_string_lossy())
}

/// Parse Go-style duration text such as `10m`, `1h30m`, `1.5h` or `500ms`.
///
/// A bare `0` is accepted. Signs are not. Fractions below a nanosecond are
/// truncated.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    let invalid = || ConfigError::InvalidDuration {
        value: text.to_string(),
    };
    if !DURATION_FULL.is_match(text) {
        return Err(invalid());
    }

    let mut total_nanos: u128 = 0;
    for caps in DURATION_PART.captures_iter(text) {
        let unit: u128 = match &caps[3] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => unreachable!("unit constrained by regex"),
        };
        let whole: u128 = caps[1].parse().map_err(|_| invalid())?;
        total_nanos = whole
            .checked_mul(unit)
            .and_then(|n| total_nanos.checked_add(n))
            .ok_or_else(invalid)?;

        if let Some(frac) = caps.get(2) {
            // 18 digits keep `digits * unit` well inside u128.
            let digits = &frac.as_str()[..frac.as_str().len().min(18)];
            let scale = 10u128.pow(digits.len() as u32);
            let value: u128 = digits.parse().map_err(|_| invalid())?;
            total_nanos = total_nanos
                .checked_add(value * unit / scale)
                .ok_or_else(invalid)?;
        }
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// Split a stop command with POSIX shell quoting rules.
fn split_command(cmd: &str) -> Result<Vec<String>, ConfigError> {
    match shlex::split(cmd) {
        Some(parts) if !parts.is_empty() => Ok(parts),
        _ => Err(ConfigError::InvalidStopCommand {
            value: cmd.to_string(),
        }),
    }
}

/// Errors raised while building a [`LimitConfig`]. All are fatal and occur
/// before the metadata file is touched.
#[derive(Debug)]
pub enum ConfigError {
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidDuration {
        value: String,
    },
    WindowOutOfRange {
        value: String,
    },
    ZeroWindow,
    ZeroMaxRestarts,
    EmptyMetadataKey,
    InvalidStopCommand {
        value: String,
    },
    MissingCommand,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadFile { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::ParseFile { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidDuration { value } => {
                write!(f, "invalid duration {value:?} (expected e.g. 90s, 10m, 1h30m, 1.5h)")
            }
            ConfigError::WindowOutOfRange { value } => {
                write!(f, "window size {value:?} is too large")
            }
            ConfigError::ZeroWindow | ConfigError::ZeroMaxRestarts => {
                write!(f, "--max-restarts and/or --window-size cannot be 0")
            }
            ConfigError::EmptyMetadataKey => write!(f, "--metadata-key cannot be empty"),
            ConfigError::InvalidStopCommand { value } => {
                write!(f, "cannot split stop command {value:?}")
            }
            ConfigError::MissingCommand => write!(f, "no command supplied"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFile { source, .. } => Some(source),
            ConfigError::ParseFile { source, .. } => Some(source),
            _ => None,
        }
    }
}
