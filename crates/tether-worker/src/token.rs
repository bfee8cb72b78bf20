//! Enrollment token discovery.
//!
//! Sources are tried in order and the first non-empty value wins:
//!   1. explicit value (CLI flag or config)
//!   2. token file named on the CLI or in config
//!   3. `$XDG_CONFIG_HOME/tether/enrollment-token`
//!   4. `$TETHER_ENROLLMENT_TOKEN`

use std::fmt;
use std::path::{Path, PathBuf};

pub const TOKEN_ENV_VAR: &str = "TETHER_ENROLLMENT_TOKEN";
pub const DEFAULT_TOKEN_FILE: &str = "enrollment-token";

/// A one-time enrollment secret. Never persisted, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct EnrollmentToken(String);

impl EnrollmentToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EnrollmentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnrollmentToken(<redacted>)")
    }
}

type Source = fn(&TokenResolver) -> Option<String>;

const SOURCES: &[(&str, Source)] = &[
    ("explicit", from_explicit),
    ("token file", from_file),
    ("default token file", from_default_file),
    ("environment", from_env),
];

fn from_explicit(r: &TokenResolver) -> Option<String> {
    r.explicit.clone()
}

fn from_file(r: &TokenResolver) -> Option<String> {
    r.file.as_deref().and_then(read_token_file)
}

fn from_default_file(r: &TokenResolver) -> Option<String> {
    r.default_file.as_deref().and_then(read_token_file)
}

fn from_env(r: &TokenResolver) -> Option<String> {
    r.env_value.clone()
}

/// Resolves the enrollment token from its configured sources.
#[derive(Default, Clone)]
pub struct TokenResolver {
    explicit: Option<String>,
    file: Option<PathBuf>,
    default_file: Option<PathBuf>,
    env_value: Option<String>,
}

impl TokenResolver {
    /// Resolver over the standard locations, reading the environment now.
    pub fn standard(explicit: Option<String>, file: Option<PathBuf>) -> Self {
        Self {
            explicit,
            file,
            default_file: Some(tether_core::config::config_dir().join(DEFAULT_TOKEN_FILE)),
            env_value: std::env::var(TOKEN_ENV_VAR).ok(),
        }
    }

    pub fn explicit(mut self, token: impl Into<String>) -> Self {
        self.explicit = Some(token.into());
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn default_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_file = Some(path.into());
        self
    }

    pub fn env_value(mut self, value: impl Into<String>) -> Self {
        self.env_value = Some(value.into());
        self
    }

    pub fn resolve(&self) -> Option<EnrollmentToken> {
        SOURCES.iter().find_map(|(name, source)| {
            let token = source(self)
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())?;
            tracing::info!(source = name, "using enrollment token");
            Some(EnrollmentToken(token))
        })
    }
}

fn read_token_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read enrollment token file");
            None
        }
    }
}
