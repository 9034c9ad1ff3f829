//! Error types for the tunnel.
//!
//! Transport faults ([`ConnectionError`]) end a session, TLS faults
//! ([`TlsError`]) are reported to the client and the session continues in
//! plaintext, and [`SessionError`] records which leg failed so the driver
//! can decide whether a final reply is still deliverable.

use std::io;

use thiserror::Error;

/// Errors raised by a single leg of the tunnel.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    Closed,

    /// The peer did not send anything within the allowed window.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),
}

/// Errors raised while preparing or performing a TLS upgrade.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load the TLS certificate chain.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load the TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Server-side TLS was requested without a certificate.
    #[error("No TLS certificate configured")]
    MissingCertificate,

    /// The private key is readable by group or others.
    #[error("Private key {path} has unsafe permissions {mode:o}")]
    UnsafePermissions { path: String, mode: u32 },

    /// The configured upstream name is not a valid TLS server name.
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// The handshake itself failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// The connection is not in a state that allows this upgrade.
    #[error("Connection is already TLS")]
    AlreadyTls,

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors raised by external collaborators (rules, crypto, authentication).
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Rule processing failed: {0}")]
    Rule(String),

    #[error("Crypto operation failed: {0}")]
    Crypto(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The collaborator lost its connection while exchanging lines.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Fatal errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client leg failed.
    #[error("Client connection failed: {0}")]
    Client(#[source] ConnectionError),

    /// The upstream leg failed.
    #[error("Upstream connection failed: {0}")]
    Upstream(#[source] ConnectionError),

    /// The client did not send a command within the idle window.
    #[error("Client idle for {0} seconds")]
    Idle(u64),

    /// The message collection deadline expired.
    #[error("Message transfer exceeded {0} seconds")]
    DataTimeout(u64),

    /// A collaborator failed in a way the session cannot recover from.
    #[error(transparent)]
    Hook(#[from] HookError),
}

impl SessionError {
    /// The reply to send the client before closing, if one should be sent.
    #[must_use]
    pub fn final_reply(&self) -> Option<&'static str> {
        match self {
            Self::Client(_) => None,
            Self::Upstream(_) | Self::Hook(_) => Some("421 4.4.0 Upstream connection failed"),
            Self::Idle(_) => Some("421 4.4.2 Idle timeout"),
            Self::DataTimeout(_) => Some("421 4.4.2 Timeout during message transfer"),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Specialized `Result` type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Specialized `Result` type for collaborator operations.
pub type HookResult<T> = std::result::Result<T, HookError>;
