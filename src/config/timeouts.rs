//! Timeout configuration for both legs of the tunnel.
//!
//! The tunnel is a server towards the client and a client towards the
//! upstream MTA, so the values here mix the two: the idle window for client
//! commands follows RFC 5321 server recommendations, while the connect and
//! reply windows bound how long the tunnel waits on the upstream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Timeout for establishing the upstream TCP connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::connect_secs")]
    pub connect_secs: u64,

    /// How long a client may stay silent between commands.
    ///
    /// Default: 300 seconds (5 minutes, per RFC 5321)
    #[serde(default = "defaults::command_secs")]
    pub command_secs: u64,

    /// How long to wait for the upstream to answer a command.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::reply_secs")]
    pub reply_secs: u64,

    /// Deadline for the whole DATA phase: collection, rules and transfer.
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "defaults::data_secs")]
    pub data_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect_secs(),
            command_secs: defaults::command_secs(),
            reply_secs: defaults::reply_secs(),
            data_secs: defaults::data_secs(),
        }
    }
}

impl Timeouts {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_secs)
    }

    #[must_use]
    pub const fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }
}

/// Default timeout values.
mod defaults {
    pub const fn connect_secs() -> u64 {
        30
    }
    pub const fn command_secs() -> u64 {
        300 // 5 minutes
    }
    pub const fn reply_secs() -> u64 {
        300 // 5 minutes
    }
    pub const fn data_secs() -> u64 {
        1800 // 30 minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_defaults() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect_secs, 30);
        assert_eq!(timeouts.command_secs, 300);
        assert_eq!(timeouts.reply_secs, 300);
        assert_eq!(timeouts.data_secs, 1800);
        assert_eq!(timeouts.data_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_partial_override() {
        let timeouts: Timeouts = toml::from_str("data_secs = 60").unwrap();
        assert_eq!(timeouts.data_timeout(), Duration::from_secs(60));
        assert_eq!(timeouts.command_timeout(), Duration::from_secs(300));
    }
}
