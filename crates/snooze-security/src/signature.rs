//! Plugin signing and verification.
//!
//! A signature is a detached JSON record (`<plugin>.sig`): SHA-256 of the
//! plugin binary, signed RSA-PKCS#1 v1.5 with a key from the [`KeyStore`].
//! Verification requires the signing key's id to be present in the
//! `trusted_keys` list of `signature_config.json`; key possession alone is
//! never sufficient.
//!
//! Binary hashes and decoded signature files are cached. A cache entry is
//! valid while the file's size and mtime are unchanged and the entry is
//! younger than the TTL (default 30 minutes).

use std::fs::{self, File};
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rsa::pkcs1v15::{Signature, SigningKey as RsaSigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use rsa::signature::SignatureEncoding;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ErrorCode, Result, SecurityError};
use crate::keys::KeyStore;

pub const SIGNATURE_VERSION: u32 = 1;
pub const HASH_ALG_SHA256: &str = "sha256";

/// The initial mandatory signature algorithm.
pub const SIG_ALG_RSA_SHA256: &str = "rsa-sha256-pkcs1v15";

/// Default signature lifetime: one year.
pub const DEFAULT_SIGNATURE_LIFETIME_DAYS: i64 = 365;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const CACHE_CAPACITY: usize = 256;

/// Contents of `signature_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    pub enabled: bool,
    #[serde(default)]
    pub trusted_keys: Vec<Uuid>,
    pub key_dir: PathBuf,
}

impl SignatureConfig {
    pub fn disabled(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: false,
            trusted_keys: Vec::new(),
            key_dir: key_dir.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            SecurityError::with_cause(ErrorCode::AuthConfigNotFound, e)
                .context("path", path.display().to_string())
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| SecurityError::with_cause(ErrorCode::AuthConfigInvalid, e))
    }

    /// Missing file yields a disabled config rooted next to `path`.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(_) => {
                let key_dir = path
                    .parent()
                    .map(|p| p.join("keys"))
                    .unwrap_or_else(|| PathBuf::from("keys"));
                Self::disabled(key_dir)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SecurityError::with_cause(ErrorCode::AuthInit, e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SecurityError::with_cause(ErrorCode::AuthInit, e))?;
        fs::write(path, json).map_err(|e| SecurityError::with_cause(ErrorCode::AuthInit, e))
    }

    pub fn is_trusted(&self, id: Uuid) -> bool {
        self.trusted_keys.contains(&id)
    }
}

/// Detached signature record persisted as `<plugin>.sig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSignature {
    pub version: u32,
    pub plugin_name: String,
    pub plugin_version: String,
    pub hash_alg: String,
    pub hash_b64: String,
    pub sig_alg: String,
    pub sig_b64: String,
    pub key_id: Uuid,
    pub issuer: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PluginSignature {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

struct HashEntry {
    size: u64,
    mtime: SystemTime,
    digest: [u8; 32],
    inserted_at: Instant,
}

struct SigEntry {
    size: u64,
    mtime: SystemTime,
    signature: PluginSignature,
    inserted_at: Instant,
}

/// Signs and verifies plugin binaries, with caching.
pub struct SignatureService {
    config: RwLock<SignatureConfig>,
    keys: KeyStore,
    hash_cache: Mutex<LruCache<PathBuf, HashEntry>>,
    sig_cache: Mutex<LruCache<PathBuf, SigEntry>>,
    cache_ttl: Duration,
}

impl SignatureService {
    pub fn new(config: SignatureConfig) -> Self {
        let keys = KeyStore::new(config.key_dir.clone());
        Self {
            config: RwLock::new(config),
            keys,
            hash_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero"),
            )),
            sig_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero"),
            )),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn config(&self) -> SignatureConfig {
        self.config.read().clone()
    }

    /// Add a key id to the trusted set. Opt-in only; `KeyStore::generate`
    /// never calls this.
    pub fn trust_key(&self, id: Uuid) {
        let mut config = self.config.write();
        if !config.trusted_keys.contains(&id) {
            config.trusted_keys.push(id);
        }
    }

    /// Revoke a key: marks the stored record and removes it from the
    /// trusted set.
    pub fn revoke_key(&self, id: Uuid) -> Result<()> {
        self.keys.revoke(id)?;
        self.config.write().trusted_keys.retain(|k| *k != id);
        Ok(())
    }

    /// SHA-256 of a file, via the size/mtime/TTL cache.
    pub fn file_sha256(&self, path: &Path) -> Result<[u8; 32]> {
        let meta = fs::metadata(path).map_err(|e| {
            SecurityError::with_cause(ErrorCode::PluginNotFound, e)
                .context("path", path.display().to_string())
        })?;
        let size = meta.len();
        let mtime = meta
            .modified()
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigVerification, e))?;

        {
            let mut cache = self.hash_cache.lock();
            if let Some(entry) = cache.get(path) {
                if entry.size == size
                    && entry.mtime == mtime
                    && entry.inserted_at.elapsed() < self.cache_ttl
                {
                    trace!(path = %path.display(), "hash cache hit");
                    return Ok(entry.digest);
                }
            }
        }

        let digest = hash_file(path)?;
        self.hash_cache.lock().put(
            path.to_path_buf(),
            HashEntry {
                size,
                mtime,
                digest,
                inserted_at: Instant::now(),
            },
        );
        Ok(digest)
    }

    /// Sign a plugin binary and write `<signatures_dir>/<name>.sig`.
    pub fn sign_plugin(
        &self,
        plugin_name: &str,
        plugin_version: &str,
        plugin_path: &Path,
        signatures_dir: &Path,
        key_id: Uuid,
        issuer: &str,
    ) -> Result<PluginSignature> {
        let key = self.keys.get(key_id)?;
        if key.is_revoked() {
            return Err(SecurityError::new(ErrorCode::SigKeyRevoked)
                .context("key_id", key_id.to_string()));
        }
        if key.is_expired() {
            return Err(SecurityError::new(ErrorCode::SigKeyExpired)
                .context("key_id", key_id.to_string()));
        }
        let private_pem = key.private_pem.as_deref().ok_or_else(|| {
            SecurityError::new(ErrorCode::SigGeneration)
                .context("key_id", key_id.to_string())
                .context("detail", "key record has no private half")
        })?;

        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigKeyInvalid, e))?;
        let digest = self.file_sha256(plugin_path)?;

        let signing_key = RsaSigningKey::<Sha256>::new(private);
        let sig: Signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;

        let now = Utc::now();
        let signature = PluginSignature {
            version: SIGNATURE_VERSION,
            plugin_name: plugin_name.to_string(),
            plugin_version: plugin_version.to_string(),
            hash_alg: HASH_ALG_SHA256.to_string(),
            hash_b64: BASE64.encode(digest),
            sig_alg: SIG_ALG_RSA_SHA256.to_string(),
            sig_b64: BASE64.encode(sig.to_vec()),
            key_id,
            issuer: issuer.to_string(),
            timestamp: now,
            expires_at: now + chrono::Duration::days(DEFAULT_SIGNATURE_LIFETIME_DAYS),
        };

        fs::create_dir_all(signatures_dir)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;
        let sig_path = signatures_dir.join(format!("{}.sig", plugin_name));
        let json = serde_json::to_string_pretty(&signature)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;
        fs::write(&sig_path, json)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigGeneration, e))?;

        debug!(plugin = plugin_name, key_id = %key_id, "signed plugin");
        Ok(signature)
    }

    /// Load `<signatures_dir>/<name>.sig`, via the decoded-signature cache.
    pub fn load_signature(&self, signatures_dir: &Path, plugin_name: &str) -> Result<PluginSignature> {
        let path = signatures_dir.join(format!("{}.sig", plugin_name));
        let meta = fs::metadata(&path).map_err(|e| {
            SecurityError::with_cause(ErrorCode::SigNotFound, e)
                .context("plugin", plugin_name.to_string())
                .context("path", path.display().to_string())
        })?;
        let size = meta.len();
        let mtime = meta
            .modified()
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigInvalid, e))?;

        {
            let mut cache = self.sig_cache.lock();
            if let Some(entry) = cache.get(&path) {
                if entry.size == size
                    && entry.mtime == mtime
                    && entry.inserted_at.elapsed() < self.cache_ttl
                {
                    return Ok(entry.signature.clone());
                }
            }
        }

        let raw = fs::read_to_string(&path)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigNotFound, e))?;
        let signature: PluginSignature = serde_json::from_str(&raw).map_err(|e| {
            SecurityError::with_cause(ErrorCode::SigInvalid, e)
                .context("path", path.display().to_string())
        })?;

        self.sig_cache.lock().put(
            path,
            SigEntry {
                size,
                mtime,
                signature: signature.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(signature)
    }

    /// Full verification pipeline for a plugin binary.
    ///
    /// Rejects, in order: missing/unparsable signature, expired signature,
    /// untrusted key, revoked key, expired key, hash mismatch, bad RSA
    /// signature. Returns the decoded signature on success.
    pub fn verify_plugin(
        &self,
        plugin_name: &str,
        plugin_path: &Path,
        signatures_dir: &Path,
    ) -> Result<PluginSignature> {
        let signature = self.load_signature(signatures_dir, plugin_name)?;

        if signature.plugin_name != plugin_name {
            return Err(SecurityError::new(ErrorCode::SigInvalid)
                .context("plugin", plugin_name.to_string())
                .context("signed_name", signature.plugin_name.clone()));
        }
        if signature.hash_alg != HASH_ALG_SHA256 || signature.sig_alg != SIG_ALG_RSA_SHA256 {
            return Err(SecurityError::new(ErrorCode::SigInvalid)
                .context("hash_alg", signature.hash_alg.clone())
                .context("sig_alg", signature.sig_alg.clone()));
        }
        if signature.is_expired() {
            return Err(SecurityError::new(ErrorCode::SigExpired)
                .context("plugin", plugin_name.to_string())
                .context("expired_at", signature.expires_at.to_rfc3339()));
        }
        if !self.config.read().is_trusted(signature.key_id) {
            return Err(SecurityError::new(ErrorCode::SigKeyNotFound)
                .context("key_id", signature.key_id.to_string())
                .context("detail", "key id not in trusted_keys"));
        }

        let key = self.keys.get(signature.key_id)?;
        if key.is_revoked() {
            return Err(SecurityError::new(ErrorCode::SigKeyRevoked)
                .context("key_id", key.id.to_string()));
        }
        if key.is_expired() {
            return Err(SecurityError::new(ErrorCode::SigKeyExpired)
                .context("key_id", key.id.to_string()));
        }

        let expected = BASE64
            .decode(&signature.hash_b64)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigInvalid, e))?;
        let actual = self.file_sha256(plugin_path)?;
        if expected != actual {
            return Err(SecurityError::new(ErrorCode::SigHashMismatch)
                .context("plugin", plugin_name.to_string())
                .context("path", plugin_path.display().to_string()));
        }

        let public = RsaPublicKey::from_public_key_pem(&key.public_pem)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigKeyInvalid, e))?;
        let sig_bytes = BASE64
            .decode(&signature.sig_b64)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigInvalid, e))?;
        let sig = Signature::try_from(sig_bytes.as_slice())
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigInvalid, e))?;

        VerifyingKey::<Sha256>::new(public)
            .verify_prehash(&actual, &sig)
            .map_err(|e| {
                SecurityError::with_cause(ErrorCode::SigVerification, e)
                    .context("plugin", plugin_name.to_string())
            })?;

        debug!(plugin = plugin_name, key_id = %signature.key_id, "signature verified");
        Ok(signature)
    }
}

fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)
        .map_err(|e| SecurityError::with_cause(ErrorCode::PluginNotFound, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| SecurityError::with_cause(ErrorCode::SigVerification, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
