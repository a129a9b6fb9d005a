//! Certificate material for mutual TLS with the control plane.
//!
//! The manager holds the CA bundle and, once the device is registered, the
//! client certificate and key. Registration generates a CSR; installing the
//! signed certificate persists key and certificate atomically and swaps the
//! in-memory material, which changes the certificate signature the HTTP
//! client watches.

use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use flotta_id::DeviceId;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls_pemfile::Item;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from certificate handling.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed PEM in {origin}: {reason}")]
    Pem { origin: String, reason: String },

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    /// The key is missing or not EC, RSA or PKCS#8.
    #[error("unsupported or missing private key in {0}")]
    UnsupportedKey(String),

    #[error("failed to generate certificate request: {0}")]
    Generate(#[from] rcgen::Error),
}

/// Client certificate chain and its private key.
#[derive(Debug, Clone)]
pub struct ClientMaterial {
    cert_pem: String,
    key_pem: String,
    signature: String,
}

impl ClientMaterial {
    /// Validate and fingerprint a certificate/key pair.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertificateError> {
        let certs = parse_certificates(cert_pem.as_bytes(), "client certificate")?;
        validate_key(key_pem.as_bytes(), "client key")?;

        let leaf = certs
            .first()
            .ok_or_else(|| CertificateError::NoCertificate("client certificate".to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            signature: hex::encode(Sha256::digest(leaf)),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Key followed by certificate, the form `reqwest::Identity` reads.
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut pem = self.key_pem.clone().into_bytes();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(self.cert_pem.as_bytes());
        pem
    }

    /// SHA-256 of the leaf certificate DER, hex encoded.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// A pending certificate signing request and its key.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub csr_pem: String,
    key_pem: String,
}

impl CertificateRequest {
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Shared certificate store.
pub struct CertificateManager {
    ca_certificates: Vec<Vec<u8>>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    client: ArcSwapOption<ClientMaterial>,
}

impl CertificateManager {
    /// Load the CA bundle and, if both files exist, the client certificate
    /// and key.
    pub fn load(
        ca_root: &Path,
        cert_file: Option<&Path>,
        key_file: Option<&Path>,
    ) -> Result<Self, CertificateError> {
        let ca_pem = read(ca_root)?;
        let ca_certificates = parse_certificates(&ca_pem, &ca_root.display().to_string())?;

        let client = match (cert_file, key_file) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => {
                let cert_pem = String::from_utf8_lossy(&read(cert)?).into_owned();
                let key_pem = String::from_utf8_lossy(&read(key)?).into_owned();
                let material = ClientMaterial::from_pem(&cert_pem, &key_pem)?;
                if key_matches_certificate(&cert_pem, &key_pem) {
                    info!(signature = %material.signature(), "Loaded client certificate");
                    Some(Arc::new(material))
                } else {
                    // Left behind by an interrupted install.
                    warn!(
                        cert = %cert.display(),
                        key = %key.display(),
                        "Client key does not match certificate, registering again"
                    );
                    None
                }
            }
            _ => None,
        };

        Ok(Self {
            ca_certificates,
            cert_path: cert_file.map(Path::to_path_buf),
            key_path: key_file.map(Path::to_path_buf),
            client: ArcSwapOption::new(client),
        })
    }

    /// In-memory manager without persistence.
    pub fn from_pem(ca_pem: &str, client: Option<ClientMaterial>) -> Result<Self, CertificateError> {
        Ok(Self {
            ca_certificates: parse_certificates(ca_pem.as_bytes(), "CA bundle")?,
            cert_path: None,
            key_path: None,
            client: ArcSwapOption::new(client.map(Arc::new)),
        })
    }

    /// CA certificates in DER form.
    pub fn ca_certificates(&self) -> &[Vec<u8>] {
        &self.ca_certificates
    }

    pub fn client(&self) -> Option<Arc<ClientMaterial>> {
        self.client.load_full()
    }

    pub fn has_client_certificate(&self) -> bool {
        self.client.load().is_some()
    }

    /// Signature of the current client certificate.
    pub fn signature(&self) -> Option<String> {
        self.client
            .load_full()
            .map(|material| material.signature().to_string())
    }

    /// Generate a P-256 key and a CSR with the device ID as common name.
    pub fn create_csr(&self, device_id: &DeviceId) -> Result<CertificateRequest, CertificateError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, device_id.as_str());
        params.distinguished_name = name;

        let csr = params.serialize_request(&key_pair)?;
        debug!(device_id = %device_id, "Created certificate request");

        Ok(CertificateRequest {
            csr_pem: csr.pem()?,
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Install a signed certificate for a pending request.
    ///
    /// Key and certificate are written atomically when paths are configured;
    /// the key file gets mode `0600`. The in-memory material is swapped last.
    pub fn install_certificate(
        &self,
        request: &CertificateRequest,
        cert_pem: &str,
    ) -> Result<(), CertificateError> {
        let material = ClientMaterial::from_pem(cert_pem, request.key_pem())?;

        if let Some(key_path) = &self.key_path {
            write_atomic(key_path, request.key_pem().as_bytes(), true)?;
        }
        if let Some(cert_path) = &self.cert_path {
            write_atomic(cert_path, cert_pem.as_bytes(), false)?;
        }

        info!(signature = %material.signature(), "Installed client certificate");
        self.client.store(Some(Arc::new(material)));
        Ok(())
    }
}

/// Whether the leaf certificate carries the key's public half.
///
/// Keys rcgen cannot read are not checked.
fn key_matches_certificate(cert_pem: &str, key_pem: &str) -> bool {
    let Ok(key) = KeyPair::from_pem(key_pem) else {
        return true;
    };
    let spki = key.public_key_der();
    parse_certificates(cert_pem.as_bytes(), "client certificate")
        .ok()
        .and_then(|certs| certs.into_iter().next())
        .is_some_and(|leaf| leaf.windows(spki.len()).any(|w| w == spki.as_slice()))
}

fn read(path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificates(pem: &[u8], origin: &str) -> Result<Vec<Vec<u8>>, CertificateError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Pem {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificate(origin.to_string()));
    }
    Ok(certs)
}

fn validate_key(pem: &[u8], origin: &str) -> Result<(), CertificateError> {
    let mut reader = BufReader::new(pem);
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| CertificateError::Pem {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;
        if matches!(item, Item::Sec1Key(_) | Item::Pkcs1Key(_) | Item::Pkcs8Key(_)) {
            return Ok(());
        }
    }
    Err(CertificateError::UnsupportedKey(origin.to_string()))
}

/// Write through a temp file in the target directory, then rename.
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), CertificateError> {
    let io_err = |source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    file.persist(path).map_err(|e| io_err(e.error))?;
    debug!(path = %path.display(), "Persisted file");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::TestCa;

    fn device_id() -> DeviceId {
        DeviceId::parse("0f6c3e5a9b8d4e2f8a1b2c3d4e5f6a7b").unwrap()
    }

    #[test]
    fn test_load_without_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new();
        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, ca.pem()).unwrap();

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let manager =
            CertificateManager::load(&ca_path, Some(&cert_path), Some(&key_path)).unwrap();

        assert_eq!(manager.ca_certificates().len(), 1);
        assert!(!manager.has_client_certificate());
        assert!(manager.signature().is_none());
    }

    #[test]
    fn test_load_rejects_missing_ca() {
        let dir = tempfile::tempdir().unwrap();
        let result = CertificateManager::load(&dir.path().join("nope.pem"), None, None);
        assert!(matches!(result, Err(CertificateError::Io { .. })));
    }

    #[test]
    fn test_load_rejects_empty_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, "not a certificate").unwrap();
        let result = CertificateManager::load(&ca_path, None, None);
        assert!(matches!(result, Err(CertificateError::NoCertificate(_))));
    }

    #[test]
    fn test_csr_contains_pem_blocks() {
        let ca = TestCa::new();
        let manager = CertificateManager::from_pem(&ca.pem(), None).unwrap();
        let request = manager.create_csr(&device_id()).unwrap();

        assert!(request.csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
        assert!(request.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_install_persists_and_changes_signature() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new();
        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, ca.pem()).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let manager =
            CertificateManager::load(&ca_path, Some(&cert_path), Some(&key_path)).unwrap();

        let request = manager.create_csr(&device_id()).unwrap();
        let signed = ca.sign(&request, device_id().as_str());
        manager.install_certificate(&request, &signed).unwrap();

        let first = manager.signature().unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(fs::read_to_string(&cert_path).unwrap(), signed);
        assert_eq!(fs::read_to_string(&key_path).unwrap(), request.key_pem());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let request = manager.create_csr(&device_id()).unwrap();
        manager
            .install_certificate(&request, &ca.sign(&request, device_id().as_str()))
            .unwrap();
        assert_ne!(manager.signature().unwrap(), first);

        let reloaded =
            CertificateManager::load(&ca_path, Some(&cert_path), Some(&key_path)).unwrap();
        assert_eq!(reloaded.signature(), manager.signature());
    }

    #[test]
    fn test_load_ignores_key_from_interrupted_install() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new();
        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, ca.pem()).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let manager =
            CertificateManager::load(&ca_path, Some(&cert_path), Some(&key_path)).unwrap();

        let request = manager.create_csr(&device_id()).unwrap();
        manager
            .install_certificate(&request, &ca.sign(&request, device_id().as_str()))
            .unwrap();

        // New key written, certificate still the old one.
        let next = manager.create_csr(&device_id()).unwrap();
        fs::write(&key_path, next.key_pem()).unwrap();

        let reloaded =
            CertificateManager::load(&ca_path, Some(&cert_path), Some(&key_path)).unwrap();
        assert!(!reloaded.has_client_certificate());
    }

    #[test]
    fn test_install_rejects_garbage() {
        let ca = TestCa::new();
        let manager = CertificateManager::from_pem(&ca.pem(), None).unwrap();
        let request = manager.create_csr(&device_id()).unwrap();

        assert!(manager.install_certificate(&request, "garbage").is_err());
        assert!(!manager.has_client_certificate());
    }

    #[test]
    fn test_unsupported_key() {
        let ca = TestCa::new();
        let result = ClientMaterial::from_pem(&ca.pem(), &ca.pem());
        assert!(matches!(result, Err(CertificateError::UnsupportedKey(_))));
    }

    #[test]
    fn test_identity_pem_has_key_then_cert() {
        let ca = TestCa::new();
        let manager = CertificateManager::from_pem(&ca.pem(), None).unwrap();
        let request = manager.create_csr(&device_id()).unwrap();
        let material =
            ClientMaterial::from_pem(&ca.sign(&request, "dev"), request.key_pem()).unwrap();

        let identity = String::from_utf8(material.identity_pem()).unwrap();
        let key_at = identity.find("PRIVATE KEY").unwrap();
        let cert_at = identity.find("BEGIN CERTIFICATE").unwrap();
        assert!(key_at < cert_at);
    }
}
