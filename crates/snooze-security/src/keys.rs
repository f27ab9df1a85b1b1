//! Signing key generation, persistence and lookup.
//!
//! Keys are RSA-2048. The full record (private half included) lives at
//! `<keys_dir>/<key_id>.json` with mode 0600; a public-only copy at
//! `<key_id>.pub.json` is what gets distributed to verifying hosts.
//! Trust is a separate decision recorded in `signature_config.json`
//! (see [`crate::signature`]); generating a key never implies trusting it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, Result, SecurityError};

pub const KEY_ALGORITHM: &str = "rsa-2048";

/// Default key lifetime: two years.
pub const DEFAULT_KEY_LIFETIME_DAYS: i64 = 730;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKey {
    pub id: Uuid,
    pub name: String,
    pub algorithm: String,
    pub public_pem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_pem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SigningKey {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Strip the private half for distribution.
    pub fn public_only(&self) -> SigningKey {
        SigningKey {
            private_pem: None,
            ..self.clone()
        }
    }
}

/// On-disk key directory with an in-memory cache.
pub struct KeyStore {
    dir: PathBuf,
    cache: RwLock<HashMap<Uuid, SigningKey>>,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generate a new RSA-2048 keypair with the default two-year expiry.
    pub fn generate(&self, name: &str) -> Result<SigningKey> {
        self.generate_with_lifetime(name, Duration::days(DEFAULT_KEY_LIFETIME_DAYS))
    }

    pub fn generate_with_lifetime(&self, name: &str, lifetime: Duration) -> Result<SigningKey> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?
            .to_string();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;

        let now = Utc::now();
        let key = SigningKey {
            id: Uuid::new_v4(),
            name: name.to_string(),
            algorithm: KEY_ALGORITHM.to_string(),
            public_pem,
            private_pem: Some(private_pem),
            created_at: now,
            expires_at: now + lifetime,
            revoked_at: None,
        };

        self.persist(&key)?;
        info!(key_id = %key.id, name = %key.name, "generated signing key");
        self.cache.write().insert(key.id, key.clone());
        Ok(key)
    }

    /// Fetch a key, hitting the disk only on cache miss.
    pub fn get(&self, id: Uuid) -> Result<SigningKey> {
        if let Some(key) = self.cache.read().get(&id) {
            return Ok(key.clone());
        }

        let key = self.load_from_disk(id)?;
        self.cache.write().insert(id, key.clone());
        Ok(key)
    }

    /// Permanently revoke a key. The record stays on disk so the
    /// revocation itself remains auditable.
    pub fn revoke(&self, id: Uuid) -> Result<SigningKey> {
        let mut key = self.get(id)?;
        if key.revoked_at.is_none() {
            key.revoked_at = Some(Utc::now());
            self.persist(&key)?;
            self.cache.write().insert(id, key.clone());
            info!(key_id = %id, "revoked signing key");
        }
        Ok(key)
    }

    /// All key records present in the directory.
    pub fn list(&self) -> Result<Vec<SigningKey>> {
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(keys),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name.ends_with(".pub.json") {
                continue;
            }
            match Self::parse_key_file(&path) {
                Ok(key) => keys.push(key),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable key file"),
            }
        }
        Ok(keys)
    }

    fn load_from_disk(&self, id: Uuid) -> Result<SigningKey> {
        let path = self.key_path(id);
        if !path.exists() {
            // Fall back to a distributed public-only copy.
            let pub_path = self.dir.join(format!("{}.pub.json", id));
            if pub_path.exists() {
                return Self::parse_key_file(&pub_path);
            }
            return Err(SecurityError::new(ErrorCode::SigKeyNotFound)
                .context("key_id", id.to_string()));
        }
        Self::parse_key_file(&path)
    }

    fn parse_key_file(path: &Path) -> Result<SigningKey> {
        let raw = fs::read_to_string(path)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigKeyInvalid, e))?;
        serde_json::from_str(&raw).map_err(|e| {
            SecurityError::with_cause(ErrorCode::SigKeyInvalid, e)
                .context("path", path.display().to_string())
        })
    }

    fn persist(&self, key: &SigningKey) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;

        let path = self.key_path(key.id);
        let json = serde_json::to_string_pretty(key)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;
        fs::write(&path, json)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;

        #[cfg(unix)]
        if key.private_pem.is_some() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
        }

        let pub_json = serde_json::to_string_pretty(&key.public_only())
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;
        fs::write(self.dir.join(format!("{}.pub.json", key.id)), pub_json)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;

        Ok(())
    }

    fn key_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}
