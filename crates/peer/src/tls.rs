//! TLS Lade- und Generierungs-Logik für Peer-Verbindungen.
//!
//! - Server: Zertifikat und Key werden aus PEM-Dateien gelesen. Fehlt eines
//!   von beiden, wird ein Self-Signed Paar erzeugt und gespeichert.
//! - Client: vertraut den System-Wurzelzertifikaten plus konfigurierten
//!   PEM-Dateien. `accept_invalid_certs` schaltet die Prüfung ganz ab
//!   (nur für Entwicklung).
//!
//! Beide Seiten nutzen den `ring` Crypto-Provider explizit, es wird kein
//! prozessweiter Default installiert.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls io '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse '{path}': {reason}")]
    Pem { path: PathBuf, reason: String },
    #[error("generate certificate: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("tls config: {0}")]
    Config(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `private` files (the key) are owner-only before any content is written.
fn write(path: &Path, contents: &str, private: bool) -> Result<(), TlsError> {
    let io = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io)?;
    #[cfg(unix)]
    if private {
        // `mode` only applies to new files.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io)?;
    }
    #[cfg(not(unix))]
    let _ = private;
    file.write_all(contents.as_bytes()).map_err(io)
}

/// Self-signed certificate for `host` (plus `localhost`). Returns (cert, key) PEM.
pub fn generate_self_signed(host: &str) -> Result<(String, String), TlsError> {
    let mut names = vec!["localhost".to_string()];
    if host != "localhost" && !host.is_empty() {
        names.push(host.to_string());
    }
    let key_pair = KeyPair::generate()?;
    let mut params = CertificateParams::new(names)?;
    params
        .distinguished_name
        .push(DnType::CommonName, format!("peer {host}"));
    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Reads the certificate pair or, when either file is missing, generates and
/// stores a self-signed one.
pub fn load_or_generate(
    cert_path: &Path,
    key_path: &Path,
    host: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
        (read(cert_path)?, read(key_path)?)
    } else {
        warn!(
            target: "peer::net::tls",
            "TLS Dateien fehlen, generiere Self-Signed: cert='{}' key='{}'",
            cert_path.display(),
            key_path.display()
        );
        let (cert, key) = generate_self_signed(host)?;
        write(cert_path, &cert, false)?;
        write(key_path, &key, true)?;
        (cert.into_bytes(), key.into_bytes())
    };

    let certs = parse_certs(&cert_pem, cert_path)?;
    let key = parse_private_key(&key_pem).map_err(|reason| TlsError::Pem {
        path: key_path.to_path_buf(),
        reason,
    })?;
    Ok((certs, key))
}

fn parse_certs(pem: &[u8], path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut rdr = pem;
    let certs = rustls_pemfile::certs(&mut rdr)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::Pem {
            path: path.to_path_buf(),
            reason: "certificate chain empty".into(),
        });
    }
    Ok(certs)
}

/// Parst einen Key (PKCS8, PKCS1 oder SEC1).
fn parse_private_key(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>, String> {
    let mut rdr = key_pem;
    match rustls_pemfile::private_key(&mut rdr) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err("no supported private key found (expected pkcs8, pkcs1 or sec1)".into()),
        Err(e) => Err(format!("read key: {e}")),
    }
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client config for dialing peers. `trusted` are extra PEM files whose
/// certificates are added to the system roots.
pub fn client_config(
    accept_invalid_certs: bool,
    trusted: &[PathBuf],
) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    if accept_invalid_certs {
        warn!(
            target: "peer::net::tls",
            "server certificate validation is disabled (accept_invalid_certs)"
        );
        let verifier = AcceptAnyServerCert {
            algorithms: provider.signature_verification_algorithms,
        };
        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!(target: "peer::net::tls", "native root certificates: {e}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    for path in trusted {
        for cert in parse_certs(&read(path)?, path)? {
            roots.add(cert)?;
        }
    }
    info!(
        target: "peer::net::tls",
        "client roots: {added} native ({ignored} ignored), {} trusted files",
        trusted.len()
    );

    let config = builder
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Skips chain and name validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
