//! TLS configuration for both legs of the tunnel.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// TLS settings shared by the client-facing and upstream-facing legs.
///
/// `certificate` and `key` are only used on the client leg, when the tunnel
/// plays the server. `ca_file` and `accept_invalid_certs` are only used on the
/// upstream leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Whether the tunnel offers STARTTLS to clients at all.
    #[serde(default)]
    pub enabled: bool,

    /// Encrypt only the upstream leg, as soon as the upstream advertises
    /// STARTTLS. The client never sees the capability.
    #[serde(default)]
    pub oneway: bool,

    /// PEM certificate chain presented to clients.
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    /// PEM private key. Defaults to `certificate` when both live in one file.
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// PEM bundle of trust anchors for the upstream. Uses the platform store
    /// when unset.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Refuse to use a private key readable by group or others.
    #[serde(default)]
    pub check_key_permissions: bool,

    /// **SECURITY WARNING**: disables upstream certificate validation.
    ///
    /// Only set to `true` for testing with self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsSettings {
    /// Path to the private key, falling back to the certificate file.
    #[must_use]
    pub fn key_path(&self) -> Option<&Path> {
        self.key.as_deref().or(self.certificate.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let tls = TlsSettings::default();
        assert!(!tls.enabled);
        assert!(!tls.oneway);
        assert!(!tls.accept_invalid_certs);
        assert_eq!(tls.key_path(), None);
    }

    #[test]
    fn test_key_falls_back_to_certificate() {
        let tls = TlsSettings {
            certificate: Some(PathBuf::from("/etc/tunnel/combined.pem")),
            ..TlsSettings::default()
        };
        assert_eq!(tls.key_path(), Some(Path::new("/etc/tunnel/combined.pem")));

        let tls = TlsSettings {
            key: Some(PathBuf::from("/etc/tunnel/key.pem")),
            ..tls
        };
        assert_eq!(tls.key_path(), Some(Path::new("/etc/tunnel/key.pem")));
    }

    #[test]
    fn test_deserialize() {
        let tls: TlsSettings = toml::from_str(
            r#"
            enabled = true
            oneway = true
            certificate = "cert.pem"
            "#,
        )
        .unwrap();
        assert!(tls.enabled);
        assert!(tls.oneway);
        assert_eq!(tls.certificate, Some(PathBuf::from("cert.pem")));
        assert_eq!(tls.key, None);
    }
}
