//! Durable worker identity: X25519 key files and the enrollment record.
//!
//! Everything is scoped by `(data_dir, service_type)`:
//!   {service_type}-curve.key       secret half, mode 0600
//!   {service_type}-curve.pub       public half
//!   {service_type}-identity.json   `WorkerIdentity`, written after enrollment
//!
//! Key material is never regenerated once both files exist. A damaged file
//! is an error for the operator to resolve, not something to paper over.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{decode_key, CryptoError, KeyPair, KEY_ENCODED_LEN};

/// The worker's enrollment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Identifier the daemon assigned at enrollment.
    pub identifier: String,
    pub service_type: String,
    pub hostname: String,
    /// Daemon's public key, Z85-encoded.
    pub daemon_public_key: String,
    pub enrolled_at: DateTime<Utc>,
}

impl WorkerIdentity {
    /// A fresh record stamped with the current time.
    pub fn new(
        identifier: impl Into<String>,
        service_type: impl Into<String>,
        hostname: impl Into<String>,
        daemon_public_key: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            service_type: service_type.into(),
            hostname: hostname.into(),
            daemon_public_key: daemon_public_key.into(),
            enrolled_at: Utc::now(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.identifier.trim().is_empty() {
            return Err("identifier is empty".into());
        }
        if self.daemon_public_key.len() != KEY_ENCODED_LEN {
            return Err(format!(
                "daemon public key must be {KEY_ENCODED_LEN} characters, got {}",
                self.daemon_public_key.len()
            ));
        }
        decode_key(&self.daemon_public_key).map_err(|e| format!("daemon public key: {e}"))?;
        Ok(())
    }
}

/// File-backed store for one service type's keys and identity.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
    service_type: String,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, service_type: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            service_type: service_type.into(),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn secret_path(&self) -> PathBuf {
        self.dir.join(format!("{}-curve.key", self.service_type))
    }

    pub fn public_path(&self) -> PathBuf {
        self.dir.join(format!("{}-curve.pub", self.service_type))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(format!("{}-identity.json", self.service_type))
    }

    // ── Keys ──────────────────────────────────────────────────────────────────

    /// Load the persisted keypair, or generate and persist a new one if
    /// either half is missing.
    pub fn load_or_generate_keypair(&self) -> Result<KeyPair, KeyStoreError> {
        let secret_path = self.secret_path();
        let public_path = self.public_path();

        if secret_path.exists() && public_path.exists() {
            let secret_text = Zeroizing::new(read(&secret_path)?);
            let public_text = read(&public_path)?;
            let secret = Zeroizing::new(parse_key_file(&secret_path, &secret_text, "secret")?);
            let public = parse_key_file(&public_path, &public_text, "public")?;

            let keypair = KeyPair::from_z85(&secret, &public)
                .map_err(|e| KeyStoreError::Crypto(secret_path.clone(), e))?;
            tracing::info!(
                service_type = %self.service_type,
                fingerprint = %keypair.fingerprint(),
                "loaded worker keys"
            );
            return Ok(keypair);
        }

        let keypair = KeyPair::generate();
        self.write_keypair(&keypair)?;
        tracing::info!(
            service_type = %self.service_type,
            fingerprint = %keypair.fingerprint(),
            path = %secret_path.display(),
            "generated worker keys"
        );
        Ok(keypair)
    }

    fn write_keypair(&self, keypair: &KeyPair) -> Result<(), KeyStoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| KeyStoreError::io(&self.dir, e))?;
        let generated = Utc::now().to_rfc3339();

        let secret_path = self.secret_path();
        let secret_content = Zeroizing::new(format!(
            "# tether {} secret key\n# generated {}\nsecret={}\n",
            self.service_type,
            generated,
            keypair.secret_z85().as_str()
        ));
        write_private(&secret_path, secret_content.as_bytes())?;

        let public_path = self.public_path();
        let public_content = format!(
            "# tether {} public key\n# generated {}\npublic={}\n",
            self.service_type,
            generated,
            keypair.public_z85()
        );
        fs::write(&public_path, public_content).map_err(|e| KeyStoreError::io(&public_path, e))?;
        Ok(())
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    /// `None` when this service type has not enrolled yet.
    pub fn load_identity(&self) -> Result<Option<WorkerIdentity>, KeyStoreError> {
        let path = self.identity_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = read(&path)?;
        let identity: WorkerIdentity =
            serde_json::from_str(&text).map_err(|e| KeyStoreError::MalformedIdentity {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        identity
            .validate()
            .map_err(|reason| KeyStoreError::MalformedIdentity {
                path: path.clone(),
                reason,
            })?;
        Ok(Some(identity))
    }

    /// Persist the identity, replacing any previous record atomically.
    pub fn save_identity(&self, identity: &WorkerIdentity) -> Result<(), KeyStoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| KeyStoreError::io(&self.dir, e))?;
        let path = self.identity_path();
        let tmp = path.with_extension("json.tmp");

        let text = serde_json::to_string_pretty(identity).map_err(|e| {
            KeyStoreError::MalformedIdentity {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        fs::write(&tmp, text).map_err(|e| KeyStoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| KeyStoreError::io(&path, e))?;

        tracing::info!(
            service_type = %self.service_type,
            identifier = %identity.identifier,
            path = %path.display(),
            "saved worker identity"
        );
        Ok(())
    }
}

// ── File helpers ──────────────────────────────────────────────────────────────

fn read(path: &Path) -> Result<String, KeyStoreError> {
    fs::read_to_string(path).map_err(|e| KeyStoreError::io(path, e))
}

/// Create or truncate `path` with owner-only permissions before writing.
fn write_private(path: &Path, content: &[u8]) -> Result<(), KeyStoreError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| KeyStoreError::io(path, e))?;

    // `mode` only applies on creation; tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| KeyStoreError::io(path, e))?;
    }

    file.write_all(content).map_err(|e| KeyStoreError::io(path, e))?;
    file.sync_all().map_err(|e| KeyStoreError::io(path, e))
}

/// Extract `field=<value>` from a key file. Comments and blank lines are
/// skipped; exactly one assignment of `field` must be present.
fn parse_key_file(path: &Path, text: &str, field: &str) -> Result<String, KeyStoreError> {
    let malformed = |reason: String| KeyStoreError::MalformedKey {
        path: path.to_path_buf(),
        reason,
    };

    let mut found: Option<String> = None;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value) = line
            .split_once('=')
            .ok_or_else(|| malformed(format!("expected `{field}=<key>`")))?;
        if name.trim() != field {
            return Err(malformed(format!(
                "expected field `{field}`, found `{}`",
                name.trim()
            )));
        }
        if found.is_some() {
            return Err(malformed(format!("`{field}` assigned more than once")));
        }
        found = Some(value.trim().to_string());
    }

    let value = found.ok_or_else(|| malformed(format!("no `{field}` line")))?;
    if value.len() != KEY_ENCODED_LEN {
        return Err(malformed(format!(
            "key must be {KEY_ENCODED_LEN} characters, got {}",
            value.len()
        )));
    }
    Ok(value)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed key file {path}: {reason}")]
    MalformedKey { path: PathBuf, reason: String },

    #[error("invalid key material in {0}: {1}")]
    Crypto(PathBuf, CryptoError),

    #[error("malformed identity {path}: {reason}")]
    MalformedIdentity { path: PathBuf, reason: String },
}

impl KeyStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
