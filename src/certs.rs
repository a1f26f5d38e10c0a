//! Per-host certificate store and SNI selection
//!
//! The store hands out rustls server material keyed by host. Material is
//! loaded from `<cert_dir>/<host>.crt` + `<cert_dir>/<host>.key` when present
//! and unexpired, otherwise a self-signed certificate is generated and
//! persisted: 2048-bit RSA, one-year validity, CN = host, SAN = DNS:host,
//! SHA-256 signature. Issuance is single-flight per host: concurrent callers
//! for a host with no ready material wait on one generation.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Validity window for generated certificates
const VALIDITY_DAYS: i64 = 365;

/// Ready-to-serve material for one host
struct ReadyCert {
    key: Arc<CertifiedKey>,
    /// Unix timestamp after which the material is expired
    not_after: i64,
}

/// Certificate store backed by a directory of PEM files
pub struct CertificateStore {
    cert_dir: PathBuf,
    ready: RwLock<HashMap<String, ReadyCert>>,
    /// Per-host issuance gates; the short outer lock only clones the gate
    issuing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generated: AtomicU64,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("cert_dir", &self.cert_dir)
            .finish()
    }
}

impl CertificateStore {
    /// Open a store over `cert_dir`, creating the directory if missing
    pub fn new(cert_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let cert_dir = cert_dir.into();
        std::fs::create_dir_all(&cert_dir).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create certificate directory '{}': {}",
                cert_dir.display(),
                e
            )
        })?;

        Ok(Self {
            cert_dir,
            ready: RwLock::new(HashMap::new()),
            issuing: Mutex::new(HashMap::new()),
            generated: AtomicU64::new(0),
        })
    }

    /// Obtain serving material for `host`, issuing it if necessary
    ///
    /// Repeated calls return functionally equivalent material; a cached
    /// context is only returned while unexpired. At most one issuance runs
    /// per host at a time; racing callers wait for the winner's result.
    pub async fn context_for(&self, host: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let host = host.to_ascii_lowercase();

        if let Some(key) = self.peek(&host) {
            return Ok(key);
        }

        let gate = {
            let mut issuing = self.issuing.lock().await;
            Arc::clone(issuing.entry(host.clone()).or_default())
        };
        let _guard = gate.lock().await;

        // A racing caller may have finished while we waited on the gate
        if let Some(key) = self.peek(&host) {
            return Ok(key);
        }

        let dir = self.cert_dir.clone();
        let task_host = host.clone();
        let (cert, was_generated) =
            tokio::task::spawn_blocking(move || load_or_generate(&dir, &task_host))
                .await
                .map_err(|e| anyhow::anyhow!("Certificate task failed: {}", e))??;

        if was_generated {
            self.generated.fetch_add(1, Ordering::Relaxed);
        }

        let key = Arc::clone(&cert.key);
        self.ready
            .write()
            .expect("certificate map lock poisoned")
            .insert(host, cert);

        Ok(key)
    }

    /// Non-blocking lookup of ready, unexpired material
    pub fn peek(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let ready = self.ready.read().expect("certificate map lock poisoned");
        let entry = ready.get(host)?;
        if entry.not_after <= unix_now() {
            return None;
        }
        Some(Arc::clone(&entry.key))
    }

    /// Number of certificates generated (as opposed to loaded) by this store
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }
}

/// Certificate file for a host
pub fn cert_path(dir: &Path, host: &str) -> PathBuf {
    dir.join(format!("{}.crt", host))
}

/// Private key file for a host
pub fn key_path(dir: &Path, host: &str) -> PathBuf {
    dir.join(format!("{}.key", host))
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn load_or_generate(dir: &Path, host: &str) -> anyhow::Result<(ReadyCert, bool)> {
    if let Some(cert) = load_from_disk(dir, host) {
        info!(host, "Loaded certificate from disk");
        return Ok((cert, false));
    }

    let cert = generate_self_signed(dir, host)?;
    info!(host, "Generated self-signed certificate");
    Ok((cert, true))
}

/// Load persisted material for a host
///
/// Returns `None` when files are missing, unparseable or expired; the caller
/// regenerates in all three cases.
fn load_from_disk(dir: &Path, host: &str) -> Option<ReadyCert> {
    let cert_file = cert_path(dir, host);
    let key_file = key_path(dir, host);

    if !cert_file.exists() || !key_file.exists() {
        return None;
    }

    let cert_data = std::fs::read(&cert_file).ok()?;
    let key_data = std::fs::read(&key_file).ok()?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
            .filter_map(|c| c.ok())
            .collect();
    if certs.is_empty() {
        warn!(host, path = %cert_file.display(), "No certificates found in file");
        return None;
    }

    let not_after = cert_not_after(&certs[0])?;
    if not_after <= unix_now() {
        info!(host, "Persisted certificate expired, re-issuing");
        return None;
    }

    let key = load_private_key(&key_data)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).ok()?;

    Some(ReadyCert {
        key: Arc::new(CertifiedKey::new(certs, signing_key)),
        not_after,
    })
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Expiry timestamp of a DER certificate
fn cert_not_after(cert: &CertificateDer<'_>) -> Option<i64> {
    use x509_parser::prelude::*;

    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => Some(parsed.validity().not_after.timestamp()),
        Err(e) => {
            warn!(error = %e, "Failed to parse X.509 certificate");
            None
        }
    }
}

/// Generate and persist a self-signed certificate for `host`
fn generate_self_signed(dir: &Path, host: &str) -> anyhow::Result<ReadyCert> {
    // 2048-bit RSA; ring signs imported RSA keys but cannot generate them
    let mut rng = rand::thread_rng();
    let rsa_key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| anyhow::anyhow!("Failed to generate RSA key: {}", e))?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .map_err(|e| anyhow::anyhow!("Failed to encode RSA key: {}", e))?;

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_der, &PKCS_RSA_SHA256)
        .map_err(|e| anyhow::anyhow!("Failed to build signing key: {}", e))?;

    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|e| anyhow::anyhow!("Invalid certificate params: {}", e))?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, host.to_string());

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| anyhow::anyhow!("Failed to self-sign certificate: {}", e))?;

    save_material(dir, host, &cert.pem(), &key_pair.serialize_pem())?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let not_after = cert_not_after(&cert_der)
        .unwrap_or_else(|| unix_now() + VALIDITY_DAYS * 24 * 60 * 60);

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(ReadyCert {
        key: Arc::new(CertifiedKey::new(vec![cert_der], signing_key)),
        not_after,
    })
}

/// Persist certificate and key PEM, key with restricted permissions
fn save_material(dir: &Path, host: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;

    let cert_file = cert_path(dir, host);
    std::fs::write(&cert_file, cert_pem)?;

    let key_file = key_path(dir, host);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_file)?;
        std::io::Write::write_all(&mut file, key_pem.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(&key_file, key_pem)?;
    }

    debug!(host, path = %cert_file.display(), "Certificate material saved");
    Ok(())
}

/// SNI-driven certificate selection for the TLS listener
///
/// Resolves the ClientHello server name against the store's ready material.
/// A missing or unknown name falls back to the first configured
/// TLS-requiring host; with no usable fallback the handshake is aborted.
pub struct SniResolver {
    store: Arc<CertificateStore>,
    fallback: Option<String>,
}

impl SniResolver {
    pub fn new(store: Arc<CertificateStore>, fallback: Option<String>) -> Self {
        Self {
            store,
            fallback: fallback.map(|h| h.to_ascii_lowercase()),
        }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            let name = name.to_ascii_lowercase();
            if let Some(key) = self.store.peek(&name) {
                return Some(key);
            }
            debug!(host = %name, "No certificate for SNI name, trying fallback");
        }

        self.fallback.as_ref().and_then(|host| self.store.peek(host))
    }
}

/// Server-side TLS configuration: TLS 1.2 minimum, no client auth, HTTP/1.1
pub fn tls_server_config(resolver: Arc<SniResolver>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "hostgate-certs-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn parsed_cert(dir: &Path, host: &str) -> (Vec<u8>, String, Vec<String>) {
        use x509_parser::prelude::*;

        let pem = std::fs::read(cert_path(dir, host)).unwrap();
        let der = rustls_pemfile::certs(&mut BufReader::new(&pem[..]))
            .next()
            .unwrap()
            .unwrap();
        let (_, cert) = X509Certificate::from_der(der.as_ref()).unwrap();

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let sans = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|n| match n {
                        GeneralName::DNSName(d) => Some(d.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        (der.as_ref().to_vec(), cn, sans)
    }

    #[tokio::test]
    async fn test_generates_and_persists_material() {
        let dir = test_dir("generate");
        let store = CertificateStore::new(&dir).unwrap();

        store.context_for("site.test").await.unwrap();

        assert!(cert_path(&dir, "site.test").exists());
        assert!(key_path(&dir, "site.test").exists());
        assert_eq!(store.generated_count(), 1);

        let key_pem = std::fs::read_to_string(key_path(&dir, "site.test")).unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));

        let (_, cn, sans) = parsed_cert(&dir, "site.test");
        assert_eq!(cn, "site.test");
        assert!(sans.contains(&"site.test".to_string()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_context_for_is_idempotent() {
        let dir = test_dir("idempotent");
        let store = CertificateStore::new(&dir).unwrap();

        let first = store.context_for("a.test").await.unwrap();
        let second = store.context_for("a.test").await.unwrap();

        assert_eq!(store.generated_count(), 1);
        assert_eq!(first.cert[0].as_ref(), second.cert[0].as_ref());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_reload_from_disk_instead_of_regenerating() {
        let dir = test_dir("reload");
        {
            let store = CertificateStore::new(&dir).unwrap();
            store.context_for("a.test").await.unwrap();
            assert_eq!(store.generated_count(), 1);
        }

        // A fresh store over the same directory must load, not re-issue
        let store = CertificateStore::new(&dir).unwrap();
        store.context_for("a.test").await.unwrap();
        assert_eq!(store.generated_count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_single_flight_issuance() {
        let dir = test_dir("singleflight");
        let store = Arc::new(CertificateStore::new(&dir).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.context_for("race.test").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.generated_count(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_expired_material_reissued() {
        let dir = test_dir("expired");
        std::fs::create_dir_all(&dir).unwrap();

        // Plant an already-expired certificate on disk
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["old.test".to_string()]).unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(30);
        params.not_after = now - time::Duration::days(1);
        let cert = params.self_signed(&key_pair).unwrap();
        std::fs::write(cert_path(&dir, "old.test"), cert.pem()).unwrap();
        std::fs::write(key_path(&dir, "old.test"), key_pair.serialize_pem()).unwrap();

        let store = CertificateStore::new(&dir).unwrap();
        store.context_for("old.test").await.unwrap();
        assert_eq!(store.generated_count(), 1);

        let (_, _, sans) = parsed_cert(&dir, "old.test");
        assert!(sans.contains(&"old.test".to_string()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_peek_unknown_host() {
        let dir = test_dir("peek");
        let store = CertificateStore::new(&dir).unwrap();
        assert!(store.peek("nothing.test").is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
