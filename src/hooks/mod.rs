//! Collaborators the session calls out to.
//!
//! The session owns the protocol; everything that decides *what* happens to
//! a message or a login lives behind these traits. [`Hooks`] bundles one
//! implementation of each, shared by every session of a listener.

mod auth;
mod crypto;
mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use self::{
    auth::{AuthOutcome, Authenticator, NoAuth, StaticAuthenticator},
    crypto::Crypto,
    rules::{ConfigRules, NoRules, Rules},
};
use crate::{
    config::Config,
    error::{ConnectionError, ConnectionResult},
    smtp::{line::strip_eol, Reply},
    transport::Transport,
};

/// A line-oriented view of one leg, for collaborators that need to hold a
/// conversation (SASL challenges, upstream AUTH).
#[async_trait]
pub trait LineChannel: Send {
    /// Send one line; CRLF is appended.
    async fn send_line(&mut self, line: &str) -> ConnectionResult<()>;

    /// Receive one line without its terminator.
    async fn receive_line(&mut self) -> ConnectionResult<String>;

    /// Receive a complete reply.
    async fn receive_reply(&mut self) -> ConnectionResult<Reply>;
}

#[async_trait]
impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> LineChannel for Transport<Stream> {
    async fn send_line(&mut self, line: &str) -> ConnectionResult<()> {
        self.send(line).await
    }

    async fn receive_line(&mut self) -> ConnectionResult<String> {
        let line = self.read_line().await?.ok_or(ConnectionError::Closed)?;
        Ok(String::from_utf8_lossy(strip_eol(&line)).into_owned())
    }

    async fn receive_reply(&mut self) -> ConnectionResult<Reply> {
        self.read_reply().await
    }
}

#[derive(Clone)]
pub struct Hooks {
    pub rules: Arc<dyn Rules>,
    pub auth: Arc<dyn Authenticator>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            rules: Arc::new(NoRules),
            auth: Arc::new(NoAuth),
        }
    }
}

impl Hooks {
    /// The built-in collaborators described by `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let rules: Arc<dyn Rules> = if config.rules.is_empty() {
            Arc::new(NoRules)
        } else {
            Arc::new(ConfigRules::new(config.rules.clone()))
        };

        let auth: Arc<dyn Authenticator> =
            if config.auth.users.is_empty() && config.auth.username.is_none() {
                Arc::new(NoAuth)
            } else {
                Arc::new(StaticAuthenticator::from(&config.auth))
            };

        Self { rules, auth }
    }
}
