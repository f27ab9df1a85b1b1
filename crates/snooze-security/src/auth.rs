//! API keys, roles and the `security.json` store.
//!
//! Each plugin has at most one active API key; regenerating replaces the
//! record in place. Tokens are 256 bits of OS CSPRNG output, URL-safe
//! base64 without padding. Permission checks resolve the key's role
//! against the role table; the `cloud_provider` role is predefined and
//! always present.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, Result, SecurityError};
use crate::permissions;

const TOKEN_BYTES: usize = 32;

/// Predefined role name granted to provider plugins.
pub const ROLE_CLOUD_PROVIDER: &str = "cloud_provider";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: HashMap<String, bool>,
}

impl Role {
    /// The built-in `cloud_provider` role: cloud operations and outbound
    /// network allowed, filesystem reads allowed, writes denied.
    pub fn cloud_provider() -> Self {
        let mut permissions = HashMap::new();
        permissions.insert(permissions::CLOUD_OPERATIONS.to_string(), true);
        permissions.insert(permissions::FILESYSTEM_READ.to_string(), true);
        permissions.insert(permissions::FILESYSTEM_WRITE.to_string(), false);
        permissions.insert(permissions::NETWORK_OUTBOUND.to_string(), true);
        Self {
            name: ROLE_CLOUD_PROVIDER.to_string(),
            permissions,
        }
    }

    pub fn allows(&self, permission: &str) -> bool {
        self.permissions.get(permission).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub plugin_name: String,
    pub token: String,
    pub role_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    pub description: String,
}

impl ApiKey {
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Utc::now() > t)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    pub enabled: bool,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSection {
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureSection {
    pub enabled: bool,
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub verify: bool,
}

/// Contents of `security.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityFile {
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub signatures: SignatureSection,
}

/// `security.json` behind a lock, with the predefined roles guaranteed.
#[derive(Debug)]
pub struct AuthStore {
    path: PathBuf,
    inner: RwLock<SecurityFile>,
}

impl AuthStore {
    /// Open (or initialize) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                SecurityError::with_cause(ErrorCode::AuthConfigNotFound, e)
                    .context("path", path.display().to_string())
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                SecurityError::with_cause(ErrorCode::AuthConfigInvalid, e)
                    .context("path", path.display().to_string())
            })?
        } else {
            SecurityFile::default()
        };

        if !file.auth.roles.iter().any(|r| r.name == ROLE_CLOUD_PROVIDER) {
            file.auth.roles.push(Role::cloud_provider());
        }

        Ok(Self {
            path,
            inner: RwLock::new(file),
        })
    }

    pub fn snapshot(&self) -> SecurityFile {
        self.inner.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().auth.enabled
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.inner.write().auth.enabled = enabled;
        self.save()
    }

    /// Generate (or regenerate) the API key for a plugin. Any existing
    /// key for the same plugin is overwritten.
    pub fn generate_key(
        &self,
        plugin_name: &str,
        role_name: &str,
        lifetime: Option<Duration>,
        description: &str,
    ) -> Result<ApiKey> {
        {
            let inner = self.inner.read();
            if !inner.auth.roles.iter().any(|r| r.name == role_name) {
                return Err(SecurityError::new(ErrorCode::AuthRoleInvalid)
                    .context("role", role_name.to_string()));
            }
        }

        let key = ApiKey {
            plugin_name: plugin_name.to_string(),
            token: generate_token(),
            role_name: role_name.to_string(),
            created_at: Utc::now(),
            expires_at: lifetime.map(|l| Utc::now() + l),
            last_used_at: None,
            revoked: false,
            description: description.to_string(),
        };

        {
            let mut inner = self.inner.write();
            inner.auth.api_keys.retain(|k| k.plugin_name != plugin_name);
            inner.auth.api_keys.push(key.clone());
        }
        self.save()?;
        info!(plugin = plugin_name, role = role_name, "generated API key");
        Ok(key)
    }

    /// Mark a plugin's key revoked. The record is kept so later
    /// presentations of the token can be distinguished from unknown keys.
    pub fn revoke_key(&self, plugin_name: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let key = inner
                .auth
                .api_keys
                .iter_mut()
                .find(|k| k.plugin_name == plugin_name)
                .ok_or_else(|| {
                    SecurityError::new(ErrorCode::AuthApiKeyInvalid)
                        .context("plugin", plugin_name.to_string())
                })?;
            key.revoked = true;
        }
        self.save()?;
        info!(plugin = plugin_name, "revoked API key");
        Ok(())
    }

    /// Validate a presented token for a plugin; returns the key's role.
    /// Touches `last_used_at` on success.
    pub fn validate(&self, plugin_name: &str, token: &str) -> Result<Role> {
        let role = {
            let mut inner = self.inner.write();

            let key = inner
                .auth
                .api_keys
                .iter_mut()
                .find(|k| k.plugin_name == plugin_name)
                .ok_or_else(|| {
                    SecurityError::new(ErrorCode::AuthApiKeyInvalid)
                        .context("plugin", plugin_name.to_string())
                })?;

            if key.token != token {
                return Err(SecurityError::new(ErrorCode::AuthApiKeyInvalid)
                    .context("plugin", plugin_name.to_string()));
            }
            if key.revoked {
                return Err(SecurityError::new(ErrorCode::AuthApiKeyRevoked)
                    .context("plugin", plugin_name.to_string()));
            }
            if key.is_expired() {
                return Err(SecurityError::new(ErrorCode::AuthApiKeyExpired)
                    .context("plugin", plugin_name.to_string()));
            }

            key.last_used_at = Some(Utc::now());
            let role_name = key.role_name.clone();

            inner
                .auth
                .roles
                .iter()
                .find(|r| r.name == role_name)
                .cloned()
                .ok_or_else(|| {
                    SecurityError::new(ErrorCode::AuthRoleInvalid)
                        .context("plugin", plugin_name.to_string())
                        .context("role", role_name)
                })?
        };

        // last_used_at bookkeeping must not fail the validation itself.
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist last_used_at");
        }

        debug!(plugin = plugin_name, role = %role.name, "API key validated");
        Ok(role)
    }

    /// Check a single permission for a plugin's current key.
    pub fn check_permission(&self, plugin_name: &str, permission: &str) -> Result<()> {
        let inner = self.inner.read();

        let key = inner
            .auth
            .api_keys
            .iter()
            .find(|k| k.plugin_name == plugin_name)
            .ok_or_else(|| {
                SecurityError::new(ErrorCode::AuthApiKeyInvalid)
                    .context("plugin", plugin_name.to_string())
            })?;

        if key.revoked {
            return Err(SecurityError::new(ErrorCode::AuthApiKeyRevoked)
                .context("plugin", plugin_name.to_string()));
        }
        if key.is_expired() {
            return Err(SecurityError::new(ErrorCode::AuthApiKeyExpired)
                .context("plugin", plugin_name.to_string()));
        }

        let role = inner
            .auth
            .roles
            .iter()
            .find(|r| r.name == key.role_name)
            .ok_or_else(|| {
                SecurityError::new(ErrorCode::AuthRoleInvalid)
                    .context("role", key.role_name.clone())
            })?;

        if !role.allows(permission) {
            return Err(SecurityError::new(ErrorCode::AuthPermissionDenied)
                .context("plugin", plugin_name.to_string())
                .context("permission", permission.to_string())
                .context("role", role.name.clone()));
        }
        Ok(())
    }

    pub fn upsert_role(&self, role: Role) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.auth.roles.retain(|r| r.name != role.name);
            inner.auth.roles.push(role);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SecurityError::with_cause(ErrorCode::AuthInit, e))?;
        }
        let json = serde_json::to_string_pretty(&*self.inner.read())
            .map_err(|e| SecurityError::with_cause(ErrorCode::AuthInit, e))?;
        fs::write(&self.path, json)
            .map_err(|e| SecurityError::with_cause(ErrorCode::AuthInit, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

/// 256 bits of CSPRNG output, URL-safe base64 without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, AuthStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AuthStore::open(dir.path().join("security.json")).expect("open");
        (dir, store)
    }

    #[test]
    fn test_cloud_provider_role_permissions() {
        let role = Role::cloud_provider();
        assert!(role.allows(permissions::CLOUD_OPERATIONS));
        assert!(role.allows(permissions::FILESYSTEM_READ));
        assert!(!role.allows(permissions::FILESYSTEM_WRITE));
        assert!(role.allows(permissions::NETWORK_OUTBOUND));
        // Unknown permissions default to denied.
        assert!(!role.allows("launch_missiles"));
    }

    #[test]
    fn test_token_is_long_and_url_safe() {
        let token = generate_token();
        assert!(token.len() >= 43, "256 bits should encode to 43+ chars");
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_generate_then_validate() {
        let (_dir, store) = store();
        let key = store
            .generate_key("aws", ROLE_CLOUD_PROVIDER, None, "test key")
            .expect("generate");

        let role = store.validate("aws", &key.token).expect("validate");
        assert_eq!(role.name, ROLE_CLOUD_PROVIDER);

        // last_used_at was touched.
        let snapshot = store.snapshot();
        assert!(snapshot.auth.api_keys[0].last_used_at.is_some());
    }

    #[test]
    fn test_regeneration_overwrites() {
        let (_dir, store) = store();
        let first = store
            .generate_key("aws", ROLE_CLOUD_PROVIDER, None, "first")
            .unwrap();
        let second = store
            .generate_key("aws", ROLE_CLOUD_PROVIDER, None, "second")
            .unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(store.snapshot().auth.api_keys.len(), 1);
        assert_eq!(
            store.validate("aws", &first.token).unwrap_err().code,
            ErrorCode::AuthApiKeyInvalid
        );
        assert!(store.validate("aws", &second.token).is_ok());
    }

    #[test]
    fn test_wrong_token_rejected() {
        let (_dir, store) = store();
        store
            .generate_key("aws", ROLE_CLOUD_PROVIDER, None, "")
            .unwrap();
        let err = store.validate("aws", "not-the-token").unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthApiKeyInvalid);
    }

    #[test]
    fn test_expired_key_rejected() {
        let (_dir, store) = store();
        let key = store
            .generate_key("aws", ROLE_CLOUD_PROVIDER, Some(Duration::seconds(-1)), "")
            .unwrap();
        let err = store.validate("aws", &key.token).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthApiKeyExpired);
    }

    #[test]
    fn test_revoked_key_rejected() {
        let (_dir, store) = store();
        let key = store
            .generate_key("aws", ROLE_CLOUD_PROVIDER, None, "")
            .unwrap();
        store.revoke_key("aws").unwrap();

        let err = store.validate("aws", &key.token).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthApiKeyRevoked);
        assert_eq!(
            store
                .check_permission("aws", permissions::CLOUD_OPERATIONS)
                .unwrap_err()
                .code,
            ErrorCode::AuthApiKeyRevoked
        );
    }

    #[test]
    fn test_permission_denied_for_restricted_role() {
        let (_dir, store) = store();
        store
            .upsert_role(Role {
                name: "read_only".to_string(),
                permissions: HashMap::from([(
                    permissions::FILESYSTEM_READ.to_string(),
                    true,
                )]),
            })
            .unwrap();
        store.generate_key("aws", "read_only", None, "").unwrap();

        let err = store
            .check_permission("aws", permissions::CLOUD_OPERATIONS)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthPermissionDenied);

        assert!(store
            .check_permission("aws", permissions::FILESYSTEM_READ)
            .is_ok());
    }

    #[test]
    fn test_unknown_role_rejected_at_generation() {
        let (_dir, store) = store();
        let err = store
            .generate_key("aws", "no_such_role", None, "")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRoleInvalid);
    }

    #[test]
    fn test_store_round_trips_through_disk() {
        let (dir, store) = store();
        let key = store
            .generate_key("gcp", ROLE_CLOUD_PROVIDER, None, "persisted")
            .unwrap();
        drop(store);

        let reopened = AuthStore::open(dir.path().join("security.json")).unwrap();
        assert!(reopened.validate("gcp", &key.token).is_ok());
    }

    #[test]
    fn test_malformed_config_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.json");
        fs::write(&path, "{ not json").unwrap();

        let err = AuthStore::open(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthConfigInvalid);
    }
}
