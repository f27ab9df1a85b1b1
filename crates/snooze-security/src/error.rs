//! Stable error codes for security failures.
//!
//! Every error produced by this crate (and by the plugin runtime's
//! security gates) carries one of these codes. The short message and the
//! resolution paragraph for each code are static and part of the public
//! contract; operator tooling matches on the code string, never on the
//! prose.

use std::collections::HashMap;
use std::fmt;

pub type Result<T> = std::result::Result<T, SecurityError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // TLS
    TlsInit,
    TlsCertNotFound,
    TlsCertInvalid,
    TlsCertExpired,
    TlsHandshake,
    TlsVerification,
    TlsCa,
    TlsGeneration,
    // Signatures
    SigNotFound,
    SigInvalid,
    SigExpired,
    SigKeyNotFound,
    SigKeyInvalid,
    SigKeyExpired,
    SigKeyRevoked,
    SigGeneration,
    SigHashMismatch,
    SigVerification,
    // Authentication
    AuthInit,
    AuthConfigNotFound,
    AuthConfigInvalid,
    AuthApiKeyInvalid,
    AuthApiKeyExpired,
    AuthApiKeyRevoked,
    AuthPermissionDenied,
    AuthRoleInvalid,
    // Plugins
    PluginNotFound,
    PluginInvalid,
    PluginCommunicationFailed,
    PluginSecurityDisabled,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 30] = [
        ErrorCode::TlsInit,
        ErrorCode::TlsCertNotFound,
        ErrorCode::TlsCertInvalid,
        ErrorCode::TlsCertExpired,
        ErrorCode::TlsHandshake,
        ErrorCode::TlsVerification,
        ErrorCode::TlsCa,
        ErrorCode::TlsGeneration,
        ErrorCode::SigNotFound,
        ErrorCode::SigInvalid,
        ErrorCode::SigExpired,
        ErrorCode::SigKeyNotFound,
        ErrorCode::SigKeyInvalid,
        ErrorCode::SigKeyExpired,
        ErrorCode::SigKeyRevoked,
        ErrorCode::SigGeneration,
        ErrorCode::SigHashMismatch,
        ErrorCode::SigVerification,
        ErrorCode::AuthInit,
        ErrorCode::AuthConfigNotFound,
        ErrorCode::AuthConfigInvalid,
        ErrorCode::AuthApiKeyInvalid,
        ErrorCode::AuthApiKeyExpired,
        ErrorCode::AuthApiKeyRevoked,
        ErrorCode::AuthPermissionDenied,
        ErrorCode::AuthRoleInvalid,
        ErrorCode::PluginNotFound,
        ErrorCode::PluginInvalid,
        ErrorCode::PluginCommunicationFailed,
        ErrorCode::PluginSecurityDisabled,
    ];

    /// Stable wire/string form, e.g. `SIG_HASH_MISMATCH`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TlsInit => "TLS_INIT",
            ErrorCode::TlsCertNotFound => "TLS_CERT_NOT_FOUND",
            ErrorCode::TlsCertInvalid => "TLS_CERT_INVALID",
            ErrorCode::TlsCertExpired => "TLS_CERT_EXPIRED",
            ErrorCode::TlsHandshake => "TLS_HANDSHAKE",
            ErrorCode::TlsVerification => "TLS_VERIFICATION",
            ErrorCode::TlsCa => "TLS_CA",
            ErrorCode::TlsGeneration => "TLS_GENERATION",
            ErrorCode::SigNotFound => "SIG_NOT_FOUND",
            ErrorCode::SigInvalid => "SIG_INVALID",
            ErrorCode::SigExpired => "SIG_EXPIRED",
            ErrorCode::SigKeyNotFound => "SIG_KEY_NOT_FOUND",
            ErrorCode::SigKeyInvalid => "SIG_KEY_INVALID",
            ErrorCode::SigKeyExpired => "SIG_KEY_EXPIRED",
            ErrorCode::SigKeyRevoked => "SIG_KEY_REVOKED",
            ErrorCode::SigGeneration => "SIG_GENERATION",
            ErrorCode::SigHashMismatch => "SIG_HASH_MISMATCH",
            ErrorCode::SigVerification => "SIG_VERIFICATION",
            ErrorCode::AuthInit => "AUTH_INIT",
            ErrorCode::AuthConfigNotFound => "AUTH_CONFIG_NOT_FOUND",
            ErrorCode::AuthConfigInvalid => "AUTH_CONFIG_INVALID",
            ErrorCode::AuthApiKeyInvalid => "AUTH_API_KEY_INVALID",
            ErrorCode::AuthApiKeyExpired => "AUTH_API_KEY_EXPIRED",
            ErrorCode::AuthApiKeyRevoked => "AUTH_API_KEY_REVOKED",
            ErrorCode::AuthPermissionDenied => "AUTH_PERMISSION_DENIED",
            ErrorCode::AuthRoleInvalid => "AUTH_ROLE_INVALID",
            ErrorCode::PluginNotFound => "PLUGIN_NOT_FOUND",
            ErrorCode::PluginInvalid => "PLUGIN_INVALID",
            ErrorCode::PluginCommunicationFailed => "PLUGIN_COMMUNICATION_FAILED",
            ErrorCode::PluginSecurityDisabled => "PLUGIN_SECURITY_DISABLED",
        }
    }

    /// One-line user-facing description.
    pub fn short_message(self) -> &'static str {
        match self {
            ErrorCode::TlsInit => "TLS subsystem failed to initialize",
            ErrorCode::TlsCertNotFound => "TLS certificate file not found",
            ErrorCode::TlsCertInvalid => "TLS certificate could not be parsed",
            ErrorCode::TlsCertExpired => "TLS certificate has expired",
            ErrorCode::TlsHandshake => "TLS handshake with the plugin failed",
            ErrorCode::TlsVerification => "peer certificate verification failed",
            ErrorCode::TlsCa => "embedded certificate authority is unusable",
            ErrorCode::TlsGeneration => "certificate generation failed",
            ErrorCode::SigNotFound => "plugin signature file not found",
            ErrorCode::SigInvalid => "plugin signature file could not be parsed",
            ErrorCode::SigExpired => "plugin signature has expired",
            ErrorCode::SigKeyNotFound => "signing key is not known or not trusted",
            ErrorCode::SigKeyInvalid => "signing key record could not be parsed",
            ErrorCode::SigKeyExpired => "signing key has expired",
            ErrorCode::SigKeyRevoked => "signing key has been revoked",
            ErrorCode::SigGeneration => "signing the plugin failed",
            ErrorCode::SigHashMismatch => "plugin binary does not match its signed hash",
            ErrorCode::SigVerification => "cryptographic signature verification failed",
            ErrorCode::AuthInit => "authentication subsystem failed to initialize",
            ErrorCode::AuthConfigNotFound => "security configuration file not found",
            ErrorCode::AuthConfigInvalid => "security configuration file could not be parsed",
            ErrorCode::AuthApiKeyInvalid => "API key is not valid for this plugin",
            ErrorCode::AuthApiKeyExpired => "API key has expired",
            ErrorCode::AuthApiKeyRevoked => "API key has been revoked",
            ErrorCode::AuthPermissionDenied => "role does not grant the required permission",
            ErrorCode::AuthRoleInvalid => "role referenced by the API key does not exist",
            ErrorCode::PluginNotFound => "plugin binary not found in the plugins directory",
            ErrorCode::PluginInvalid => "plugin did not complete a valid handshake",
            ErrorCode::PluginCommunicationFailed => "RPC to the plugin failed",
            ErrorCode::PluginSecurityDisabled => "operation requires a security feature that is disabled",
        }
    }

    /// Resolution guidance shown to operators alongside the short message.
    pub fn resolution(self) -> &'static str {
        match self {
            ErrorCode::TlsInit => {
                "Check that the certificate directory exists and is writable by the agent, \
                 then restart. If the directory was created by another user, fix its \
                 ownership or point SNOOZE_CERT_DIR at a fresh location."
            }
            ErrorCode::TlsCertNotFound => {
                "The per-plugin certificate has not been issued yet or was deleted. Remove \
                 the plugin's subdirectory under the certificate directory and reload the \
                 plugin; the runtime reissues leaf certificates on demand."
            }
            ErrorCode::TlsCertInvalid => {
                "The PEM files on disk are corrupt or were generated by an incompatible \
                 tool. Delete the offending cert.pem/key.pem pair and reload the plugin to \
                 regenerate them from the embedded CA."
            }
            ErrorCode::TlsCertExpired => {
                "Leaf certificates are valid for two years. Delete the plugin's certificate \
                 directory and reload the plugin to obtain a fresh certificate. If the CA \
                 itself expired, remove the ca/ directory as well; all plugins will be \
                 reissued on next load."
            }
            ErrorCode::TlsHandshake => {
                "The plugin and agent could not agree on a TLS session. Verify both sides \
                 are using certificates from the same CA directory and that the plugin was \
                 restarted after any certificate change. Minimum accepted version is TLS 1.2."
            }
            ErrorCode::TlsVerification => {
                "The peer presented a certificate that does not chain to the embedded CA. \
                 If the CA was regenerated, reissue the plugin certificate. Do not enable \
                 skip-verify outside of local debugging."
            }
            ErrorCode::TlsCa => {
                "The CA key or certificate under <cert_dir>/ca is missing or unreadable. \
                 Restore it from backup, or delete the ca/ directory to generate a new CA \
                 (this invalidates all previously issued plugin certificates)."
            }
            ErrorCode::TlsGeneration => {
                "Certificate generation failed, usually from a full disk or missing \
                 directory permissions. Free space or fix permissions on the certificate \
                 directory and retry."
            }
            ErrorCode::SigNotFound => {
                "No <plugin>.sig file exists in the signatures directory. Sign the plugin \
                 binary with a trusted key, or disable signature verification if this \
                 environment does not require it."
            }
            ErrorCode::SigInvalid => {
                "The signature file is not valid JSON or is missing required fields. \
                 Re-sign the plugin; do not edit .sig files by hand."
            }
            ErrorCode::SigExpired => {
                "The signature's expiry has passed. Re-sign the plugin binary with a \
                 current key to produce a fresh signature."
            }
            ErrorCode::SigKeyNotFound => {
                "The key id in the signature is absent from the trusted_keys list in \
                 signature_config.json. Add the key id to trusted_keys if you trust its \
                 holder, or re-sign with an already-trusted key."
            }
            ErrorCode::SigKeyInvalid => {
                "The key record in the key directory could not be parsed. Restore the key \
                 file from backup or generate and trust a new key, then re-sign affected \
                 plugins."
            }
            ErrorCode::SigKeyExpired => {
                "Signing keys are valid for two years by default. Generate a new key, add \
                 it to trusted_keys, and re-sign affected plugins."
            }
            ErrorCode::SigKeyRevoked => {
                "The key was explicitly revoked and will never verify again. Re-sign the \
                 plugin with a different trusted key. If the revocation was accidental, a \
                 new key must still be issued; revocation is permanent."
            }
            ErrorCode::SigGeneration => {
                "Signing failed, usually because the key's private half is absent (public \
                 distribution copies cannot sign) or the binary is unreadable. Use the full \
                 key record and verify file permissions."
            }
            ErrorCode::SigHashMismatch => {
                "The plugin binary changed after it was signed. If the change is expected \
                 (upgrade), re-sign the new binary; otherwise treat the host as compromised \
                 and do not load the plugin."
            }
            ErrorCode::SigVerification => {
                "The RSA signature does not match the recorded hash, which means the .sig \
                 file does not belong to this binary/key pair. Re-sign the plugin and \
                 confirm the signing key's id matches the signature's key_id."
            }
            ErrorCode::AuthInit => {
                "Authentication could not start. Confirm the config directory exists and \
                 security.json is readable by the agent."
            }
            ErrorCode::AuthConfigNotFound => {
                "security.json is missing from the config directory. Generate an API key \
                 for at least one plugin to create it, or disable authentication."
            }
            ErrorCode::AuthConfigInvalid => {
                "security.json is present but malformed. Fix the JSON syntax or delete the \
                 file and regenerate keys; regeneration overwrites cleanly."
            }
            ErrorCode::AuthApiKeyInvalid => {
                "No active API key matches this plugin, or the presented token differs \
                 from the stored one. Regenerate the plugin's key and update the agent's \
                 SNOOZE_API_KEY accordingly."
            }
            ErrorCode::AuthApiKeyExpired => {
                "The key's expiry has passed. Regenerate the key; regeneration replaces \
                 the old record in place."
            }
            ErrorCode::AuthApiKeyRevoked => {
                "The key was revoked. Generate a new key for the plugin if access should \
                 be restored."
            }
            ErrorCode::AuthPermissionDenied => {
                "The plugin's role does not allow the requested operation. Assign a role \
                 that grants the permission (cloud operations require cloud_operations) or \
                 leave the denial in place if it is intentional."
            }
            ErrorCode::AuthRoleInvalid => {
                "The role named by the API key is not defined in security.json. Add the \
                 role definition or regenerate the key with a predefined role such as \
                 cloud_provider."
            }
            ErrorCode::PluginNotFound => {
                "No executable with that name exists in the plugins directory. Check the \
                 name against discovery output and the SNOOZE_PLUGINS_DIR setting."
            }
            ErrorCode::PluginInvalid => {
                "The binary started but did not present a valid handshake line in time. \
                 Confirm it is a snooze plugin built against a compatible protocol version \
                 and that it was launched with the correct magic cookie."
            }
            ErrorCode::PluginCommunicationFailed => {
                "The RPC channel to the plugin broke or timed out. Check the plugin \
                 process's stderr output; the runtime reaps crashed plugins automatically \
                 and a reload usually suffices."
            }
            ErrorCode::PluginSecurityDisabled => {
                "The requested operation needs signature verification, authentication, or \
                 TLS, and that feature is switched off. Enable the feature in the \
                 environment (SNOOZE_SIGNATURE_CHECK / SNOOZE_AUTH / SNOOZE_TLS) first."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security failure: stable code, static short message, optional cause,
/// and a context map naming the involved plugin/key/path.
#[derive(Debug, thiserror::Error)]
pub struct SecurityError {
    pub code: ErrorCode,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub context: HashMap<String, String>,
}

impl SecurityError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            cause: None,
            context: HashMap::new(),
        }
    }

    pub fn with_cause(
        code: ErrorCode,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            code,
            cause: Some(cause.into()),
            context: HashMap::new(),
        }
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.code.short_message())?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, " (")?;
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_code_has_messages() {
        for code in ErrorCode::ALL {
            assert!(!code.as_str().is_empty());
            assert!(!code.short_message().is_empty(), "{} lacks message", code);
            assert!(code.resolution().len() > 40, "{} lacks guidance", code);
        }
    }

    #[test]
    fn test_code_strings_use_stable_prefixes() {
        for code in ErrorCode::ALL {
            let s = code.as_str();
            assert!(
                s.starts_with("TLS_")
                    || s.starts_with("SIG_")
                    || s.starts_with("AUTH_")
                    || s.starts_with("PLUGIN_"),
                "unexpected prefix: {}",
                s
            );
        }
    }

    #[test]
    fn test_display_includes_code_and_context() {
        let err = SecurityError::new(ErrorCode::SigHashMismatch)
            .context("plugin", "aws")
            .context("path", "/opt/plugins/aws");

        let text = err.to_string();
        assert!(text.starts_with("SIG_HASH_MISMATCH:"));
        assert!(text.contains("plugin=aws"));
        assert!(text.contains("path=/opt/plugins/aws"));
    }

    #[test]
    fn test_cause_is_chained() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = SecurityError::with_cause(ErrorCode::SigNotFound, io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
