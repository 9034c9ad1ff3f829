//! Building rustls acceptors and connectors from [`TlsSettings`].
//!
//! Certificates and keys are read from disk on every call, so a STARTTLS
//! attempt always sees the files as they currently are.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::{
    rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
        ClientConfig, CommonState, DigitallySignedStruct, ProtocolVersion, RootCertStore,
        ServerConfig, SignatureScheme, SupportedCipherSuite,
    },
    TlsAcceptor, TlsConnector,
};

use crate::{
    config::TlsSettings,
    error::{TlsError, TlsResult},
    internal,
};

/// Negotiated parameters of an upgraded connection, for logging.
#[derive(Debug, Clone, Copy)]
pub struct TlsInfo {
    version: ProtocolVersion,
    cipher: SupportedCipherSuite,
}

impl TlsInfo {
    pub(crate) fn of(conn: &CommonState) -> Option<Self> {
        Some(Self {
            version: conn.protocol_version()?,
            cipher: conn.negotiated_cipher_suite()?,
        })
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version
            .as_str()
            .map_or_else(String::default, str::to_string)
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.cipher
            .suite()
            .as_str()
            .map_or_else(String::default, str::to_string)
    }
}

fn load_certs(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let certs = File::open(path)
        .map(BufReader::new)
        .and_then(|mut reader| rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>())
        .map_err(|source| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad {
            path: path.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no certificates found",
            ),
        });
    }

    Ok(certs)
}

/// Load the first private key in `path`. The file may also hold
/// certificates, which are skipped.
fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => {}
        }
    }

    Err(TlsError::KeyLoad {
        path: path_str,
        reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
            .to_string(),
    })
}

/// Refuse keys readable or writable by group or others.
#[cfg(unix)]
pub fn check_key_permissions(path: &Path) -> TlsResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)
        .map_err(|e| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .permissions()
        .mode()
        & 0o777;

    if mode & 0o077 == 0 {
        Ok(())
    } else {
        Err(TlsError::UnsafePermissions {
            path: path.display().to_string(),
            mode,
        })
    }
}

#[cfg(not(unix))]
pub fn check_key_permissions(_path: &Path) -> TlsResult<()> {
    Ok(())
}

/// Build the acceptor used when a client asks for STARTTLS.
///
/// # Errors
///
/// Fails when no certificate is configured, when either file cannot be
/// loaded, or when the key permissions are unsafe and checking is enabled.
pub fn acceptor(settings: &TlsSettings) -> TlsResult<TlsAcceptor> {
    let certificate = settings
        .certificate
        .as_deref()
        .ok_or(TlsError::MissingCertificate)?;
    let key_path = settings.key_path().ok_or(TlsError::MissingCertificate)?;

    let certs = load_certs(certificate)?;
    if settings.check_key_permissions {
        check_key_permissions(key_path)?;
    }
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector used towards the upstream.
///
/// # Errors
///
/// Fails when the configured CA file cannot be read.
pub fn connector(settings: &TlsSettings) -> TlsResult<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_file) = settings.ca_file.as_deref() {
        let (added, ignored) = root_store.add_parsable_certificates(load_certs(ca_file)?);
        internal!(
            level = DEBUG,
            "Loaded {} trust anchors from {} ({} ignored)",
            added,
            ca_file.display(),
            ignored
        );
    } else {
        let certs = rustls_native_certs::load_native_certs();
        let (added, ignored) = root_store.add_parsable_certificates(certs.certs);
        if !certs.errors.is_empty() {
            tracing::warn!(?certs.errors, "Some certificates could not be loaded");
        }
        internal!(
            level = DEBUG,
            "Loaded {} platform trust anchors ({} ignored)",
            added,
            ignored
        );
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if settings.accept_invalid_certs {
        tracing::warn!("Upstream certificate validation is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the name used for SNI and verification of the upstream.
///
/// # Errors
///
/// Fails when `name` is neither a DNS name nor an IP address.
pub fn server_name(name: &str) -> TlsResult<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TlsError::InvalidServerName(format!("{name}: {e}")))
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
