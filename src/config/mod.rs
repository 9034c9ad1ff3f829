//! Tunnel configuration, read from a TOML file.
//!
//! Every section except `[upstream]` is optional and falls back to its
//! defaults, so the smallest useful configuration is:
//!
//! ```toml
//! [upstream]
//! address = "mail.example.com:25"
//! ```

mod timeouts;
mod tls;

use std::{collections::BTreeMap, net::SocketAddr, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

pub use self::{timeouts::Timeouts, tls::TlsSettings};
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the tunnel accepts clients on.
    #[serde(default = "defaults::listen")]
    pub listen: SocketAddr,

    pub upstream: Upstream,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub tls: TlsSettings,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub rules: RuleSettings,
}

/// The MTA every session is relayed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    /// `host:port` of the upstream MTA.
    pub address: String,

    /// Name used for SNI and certificate verification. Defaults to the host
    /// part of `address`.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Upstream {
    #[must_use]
    pub fn server_name(&self) -> &str {
        if let Some(name) = &self.server_name {
            return name;
        }

        let host = self
            .address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _port)| host);
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// Who terminates the DATA phase towards the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelMode {
    /// The tunnel writes the `.` terminator after the message.
    #[default]
    Transparent,

    /// The upstream is a delivery agent that owns data termination.
    Mda,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default)]
    pub mode: TunnelMode,

    /// Domain announced in every upstream EHLO. When unset, the argument of
    /// the client's first EHLO is used.
    #[serde(default)]
    pub ehlo_domain: Option<String>,

    /// Buffer the whole body instead of only the first MIME part.
    #[serde(default)]
    pub collect_entire_body: bool,

    /// The upstream is a local MTA: STARTTLS only encrypts the client leg.
    #[serde(default)]
    pub local_mta: bool,

    /// Authenticate to the upstream with the `[auth]` credentials.
    #[serde(default)]
    pub esmtp_auth: bool,

    /// Name the tunnel in the upstream's greeting.
    #[serde(default = "defaults::rewrite_banner")]
    pub rewrite_banner: bool,

    /// Marker in a Subject header after which the text is a rule trigger.
    #[serde(default = "defaults::trigger")]
    pub trigger: String,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            mode: TunnelMode::default(),
            ehlo_domain: None,
            collect_entire_body: false,
            local_mta: false,
            esmtp_auth: false,
            rewrite_banner: defaults::rewrite_banner(),
            trigger: defaults::trigger(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Credentials presented to the upstream when `esmtp_auth` is set.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Users allowed to authenticate against the tunnel itself. Leaving this
    /// empty passes client AUTH commands through to the upstream.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSpec {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSettings {
    #[serde(default)]
    pub add_headers: Vec<HeaderSpec>,

    /// Header names to drop, compared case-insensitively.
    #[serde(default)]
    pub remove_headers: Vec<String>,

    /// Text appended to the collected body.
    #[serde(default)]
    pub footer: Option<String>,

    #[serde(default)]
    pub sign: bool,

    #[serde(default)]
    pub encrypt: bool,
}

impl RuleSettings {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add_headers.is_empty()
            && self.remove_headers.is_empty()
            && self.footer.is_none()
            && !self.sign
            && !self.encrypt
    }
}

impl Config {
    /// Read and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        contents.parse()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.upstream.address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.address must not be empty".to_string(),
            ));
        }

        if self.tunnel.trigger.is_empty() {
            return Err(ConfigError::Invalid(
                "tunnel.trigger must not be empty".to_string(),
            ));
        }

        if self.tunnel.esmtp_auth
            && (self.auth.username.is_none() || self.auth.password.is_none())
        {
            return Err(ConfigError::Invalid(
                "tunnel.esmtp_auth requires auth.username and auth.password".to_string(),
            ));
        }

        Ok(self)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        toml::from_str::<Self>(contents)?.validate()
    }
}

mod defaults {
    use std::net::SocketAddr;

    pub fn listen() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 2525))
    }

    pub const fn rewrite_banner() -> bool {
        true
    }

    pub fn trigger() -> String {
        String::from("@@")
    }
}
