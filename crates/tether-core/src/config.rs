//! Configuration system for tether workers.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub daemon: DaemonConfig,
    pub enrollment: EnrollmentConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding key files and the persisted identity.
    pub data_dir: PathBuf,
    /// Storage scope for key material and identity.
    pub service_type: String,
    /// Reported to the daemon at enrollment. Empty = detect.
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Correlated request/reply endpoint (`tcp://host:port` or `ipc://path`).
    pub request_address: String,
    /// Broadcast endpoint the daemon publishes work on.
    pub broadcast_address: String,
    /// Enrollment endpoint. Only contacted when no identity is persisted.
    pub enrollment_address: String,
    pub security: SecurityMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    /// Explicit enrollment token. Highest priority.
    pub token: Option<String>,
    /// File holding the token.
    pub token_file: Option<PathBuf>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Announced in AttachWorker and Pong.
    pub worker_type: String,
    /// Accept any non-empty attach reply that fails to decode.
    pub lenient_attach: bool,
}

/// Whether the worker enrolls and seals its channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Trusted when every daemon endpoint is `ipc://`, curve otherwise.
    #[default]
    Auto,
    /// Enroll and seal every channel.
    Curve,
    /// Local trust: no enrollment, plaintext channels.
    Trusted,
}

impl SecurityMode {
    /// Collapse `Auto` using the endpoint schemes. One network endpoint is
    /// enough to require sealing.
    pub fn resolve(self, request_address: &str, broadcast_address: &str) -> SecurityMode {
        let local = |address: &str| address.starts_with("ipc://");
        match self {
            SecurityMode::Auto if local(request_address) && local(broadcast_address) => {
                SecurityMode::Trusted
            }
            SecurityMode::Auto => SecurityMode::Curve,
            explicit => explicit,
        }
    }
}

impl FromStr for SecurityMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(SecurityMode::Auto),
            "curve" => Ok(SecurityMode::Curve),
            "trusted" => Ok(SecurityMode::Trusted),
            other => Err(ConfigError::InvalidValue("security", other.to_string())),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
            service_type: "echo-worker".into(),
            hostname: String::new(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            request_address: "tcp://127.0.0.1:7898".into(),
            broadcast_address: "tcp://127.0.0.1:7899".into(),
            enrollment_address: "tcp://127.0.0.1:7900".into(),
            security: SecurityMode::Auto,
        }
    }
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_file: None,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: 30,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_type: "echo".into(),
            lenient_attach: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

/// `$XDG_CONFIG_HOME/tether`, falling back to `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, still applying env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists at `path`. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Apply TETHER_<SECTION>__<FIELD> overrides read through `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("TETHER_IDENTITY__DATA_DIR") {
            self.identity.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("TETHER_IDENTITY__SERVICE_TYPE") {
            self.identity.service_type = v;
        }
        if let Some(v) = var("TETHER_IDENTITY__HOSTNAME") {
            self.identity.hostname = v;
        }
        if let Some(v) = var("TETHER_DAEMON__REQUEST_ADDRESS") {
            self.daemon.request_address = v;
        }
        if let Some(v) = var("TETHER_DAEMON__BROADCAST_ADDRESS") {
            self.daemon.broadcast_address = v;
        }
        if let Some(v) = var("TETHER_DAEMON__ENROLLMENT_ADDRESS") {
            self.daemon.enrollment_address = v;
        }
        if let Some(v) = var("TETHER_DAEMON__SECURITY") {
            self.daemon.security = v.parse()?;
        }
        if let Some(v) = var("TETHER_ENROLLMENT__TOKEN_FILE") {
            self.enrollment.token_file = Some(PathBuf::from(v));
        }
        if let Some(v) = var("TETHER_ENROLLMENT__INITIAL_DELAY_MS") {
            self.enrollment.initial_delay_ms = parse_num("enrollment.initial_delay_ms", &v)?;
        }
        if let Some(v) = var("TETHER_ENROLLMENT__MAX_DELAY_MS") {
            self.enrollment.max_delay_ms = parse_num("enrollment.max_delay_ms", &v)?;
        }
        if let Some(v) = var("TETHER_ENROLLMENT__MAX_ATTEMPTS") {
            self.enrollment.max_attempts = parse_num("enrollment.max_attempts", &v)?;
        }
        if let Some(v) = var("TETHER_WORKER__WORKER_TYPE") {
            self.worker.worker_type = v;
        }
        if let Some(v) = var("TETHER_WORKER__LENIENT_ATTACH") {
            self.worker.lenient_attach = v == "true" || v == "1";
        }
        Ok(())
    }
}

fn parse_num<T: FromStr>(field: &'static str, v: &str) -> Result<T, ConfigError> {
    v.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(field, v.to_string()))
}
