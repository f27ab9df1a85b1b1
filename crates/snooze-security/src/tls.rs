//! Embedded certificate authority and TLS configuration for plugin links.
//!
//! The CA lives under `<cert_dir>/ca/{cert.pem,key.pem}` and is generated
//! on first use (RSA-2048, ten-year lifetime). Every plugin gets a leaf
//! certificate under `<cert_dir>/<plugin>/` with `CN=<plugin>` and SANs
//! for the plugin name, `localhost` and `127.0.0.1` (two-year lifetime).
//! The agent itself connects with a leaf issued under the reserved name
//! `agent`. Both sides require and verify the peer certificate against
//! the pinned CA; the minimum accepted protocol version is TLS 1.2.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, info};

use crate::error::{ErrorCode, Result, SecurityError};

/// Reserved leaf name the agent uses for its client certificate.
pub const AGENT_LEAF_NAME: &str = "agent";

const CA_LIFETIME_DAYS: i64 = 3650;
const LEAF_LIFETIME_DAYS: i64 = 730;

/// Reissue margin: certificates older than lifetime minus this are
/// treated as stale and regenerated from the CA.
const REISSUE_MARGIN_DAYS: u64 = 30;

fn install_crypto_provider() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// The runtime's certificate authority plus per-plugin config caches.
pub struct CertAuthority {
    cert_dir: PathBuf,
    server_cache: RwLock<HashMap<String, Arc<ServerConfig>>>,
    client_cache: RwLock<HashMap<String, Arc<ClientConfig>>>,
}

impl CertAuthority {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        install_crypto_provider();
        Self {
            cert_dir: cert_dir.into(),
            server_cache: RwLock::new(HashMap::new()),
            client_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Path pair for a leaf, issuing it first if needed.
    pub fn ensure_leaf(&self, name: &str) -> Result<(PathBuf, PathBuf)> {
        let (ca_cert_pem, ca_key_pem) = self.ensure_ca()?;

        let dir = self.cert_dir.join(name);
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        if is_fresh(&cert_path, LEAF_LIFETIME_DAYS as u64) && key_path.exists() {
            return Ok((cert_path, key_path));
        }

        fs::create_dir_all(&dir)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;

        let key_pem = generate_rsa_key_pem()?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;

        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;

        let mut params = CertificateParams::new(vec![name.to_string(), "localhost".to_string()])
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;
        params
            .subject_alt_names
            .push(SanType::IpAddress("127.0.0.1".parse().expect("literal ip")));
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_LIFETIME_DAYS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .signed_by(&key_pair, &ca_cert, &ca_key)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;

        fs::write(&cert_path, cert.pem())
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;
        write_key_file(&key_path, &key_pem)?;

        // A new leaf invalidates any cached config built from the old one.
        self.server_cache.write().remove(name);
        self.client_cache.write().remove(name);

        info!(leaf = name, "issued plugin certificate");
        Ok((cert_path, key_path))
    }

    /// Server-side TLS config for a plugin: presents the plugin's leaf,
    /// requires and verifies a client certificate from our CA.
    pub fn server_config(&self, plugin_name: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.server_cache.read().get(plugin_name) {
            return Ok(config.clone());
        }

        let (cert_path, key_path) = self.ensure_leaf(plugin_name)?;
        let chain = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;
        let roots = self.root_store()?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsInit, e))?;

        let config = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| SecurityError::with_cause(ErrorCode::TlsInit, e))?;

        let config = Arc::new(config);
        self.server_cache
            .write()
            .insert(plugin_name.to_string(), config.clone());
        Ok(config)
    }

    /// Client-side TLS config: pins the CA, presents the agent leaf.
    /// With `skip_verify` the server certificate is accepted unchecked
    /// (insecure; local debugging only).
    pub fn client_config(&self, skip_verify: bool) -> Result<Arc<ClientConfig>> {
        let cache_key = if skip_verify { "insecure" } else { "default" };
        if let Some(config) = self.client_cache.read().get(cache_key) {
            return Ok(config.clone());
        }

        let (cert_path, key_path) = self.ensure_leaf(AGENT_LEAF_NAME)?;
        let chain = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;

        let builder = ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ]);

        let config = if skip_verify {
            debug!("TLS server verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
                .with_client_auth_cert(chain, key)
        } else {
            builder
                .with_root_certificates(self.root_store()?)
                .with_client_auth_cert(chain, key)
        }
        .map_err(|e| SecurityError::with_cause(ErrorCode::TlsInit, e))?;

        let config = Arc::new(config);
        self.client_cache
            .write()
            .insert(cache_key.to_string(), config.clone());
        Ok(config)
    }

    /// CA cert/key PEM, generating the pair on first use.
    pub fn ensure_ca(&self) -> Result<(String, String)> {
        let ca_dir = self.cert_dir.join("ca");
        let cert_path = ca_dir.join("cert.pem");
        let key_path = ca_dir.join("key.pem");

        if is_fresh(&cert_path, CA_LIFETIME_DAYS as u64) && key_path.exists() {
            let cert = fs::read_to_string(&cert_path)
                .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;
            let key = fs::read_to_string(&key_path)
                .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;
            return Ok((cert, key));
        }

        fs::create_dir_all(&ca_dir)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;

        let key_pem = generate_rsa_key_pem()?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "snooze embedded CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(CA_LIFETIME_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;

        fs::write(&cert_path, cert.pem())
            .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCa, e))?;
        write_key_file(&key_path, &key_pem)?;

        info!(dir = %ca_dir.display(), "generated embedded CA");
        Ok((cert.pem(), key_pem))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let (ca_pem, _) = self.ensure_ca()?;
        let mut roots = RootCertStore::empty();
        let mut reader = BufReader::new(ca_pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| SecurityError::with_cause(ErrorCode::TlsCertInvalid, e))?;
            roots
                .add(cert)
                .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCertInvalid, e))?;
        }
        Ok(roots)
    }
}

/// RSA-2048 private key as PKCS#8 PEM.
fn generate_rsa_key_pem() -> Result<String> {
    let mut rng = rand::rngs::OsRng;
    let key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;
    Ok(key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?
        .to_string())
}

fn write_key_file(path: &Path, pem: &str) -> Result<()> {
    fs::write(path, pem).map_err(|e| SecurityError::with_cause(ErrorCode::TlsGeneration, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

/// True when the file exists and its issuance time (mtime) is younger
/// than the lifetime minus the reissue margin.
fn is_fresh(path: &Path, lifetime_days: u64) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    let usable = StdDuration::from_secs((lifetime_days - REISSUE_MARGIN_DAYS.min(lifetime_days)) * 86_400);
    match SystemTime::now().duration_since(mtime) {
        Ok(age) => age < usable,
        Err(_) => true,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let raw = fs::read(path).map_err(|e| {
        SecurityError::with_cause(ErrorCode::TlsCertNotFound, e)
            .context("path", path.display().to_string())
    })?;
    let mut reader = BufReader::new(raw.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCertInvalid, e))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let raw = fs::read(path).map_err(|e| {
        SecurityError::with_cause(ErrorCode::TlsCertNotFound, e)
            .context("path", path.display().to_string())
    })?;
    let mut reader = BufReader::new(raw.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SecurityError::with_cause(ErrorCode::TlsCertInvalid, e))?
        .ok_or_else(|| {
            SecurityError::new(ErrorCode::TlsCertInvalid)
                .context("path", path.display().to_string())
                .context("detail", "no private key in file")
        })
}

/// Accepts any server certificate. Used only under the explicit
/// skip-verify toggle.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
