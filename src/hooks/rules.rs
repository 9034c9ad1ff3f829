use std::sync::Arc;

use async_trait::async_trait;

use super::Crypto;
use crate::{
    config::RuleSettings,
    error::{HookError, HookResult},
    internal,
    smtp::{Message, Reply},
};

/// Message rewriting, run once per message between collection and
/// transmission.
#[async_trait]
pub trait Rules: Send + Sync {
    /// Rewrite `message` in place.
    async fn transform(&self, message: &mut Message) -> HookResult<()>;

    /// Extra capability lines to advertise in EHLO replies.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Answer an `XDATABASE` command locally. `None` forwards it upstream.
    async fn xdatabase(&self, _argument: &str) -> Option<Reply> {
        None
    }
}

/// Leaves every message untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRules;

#[async_trait]
impl Rules for NoRules {
    async fn transform(&self, _message: &mut Message) -> HookResult<()> {
        Ok(())
    }
}

/// The fixed rules of the `[rules]` configuration section.
#[derive(Clone)]
pub struct ConfigRules {
    settings: RuleSettings,
    crypto: Option<Arc<dyn Crypto>>,
}

impl ConfigRules {
    #[must_use]
    pub fn new(settings: RuleSettings) -> Self {
        Self {
            settings,
            crypto: None,
        }
    }

    #[must_use]
    pub fn with_crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    fn crypto(&self) -> HookResult<&dyn Crypto> {
        self.crypto
            .as_deref()
            .ok_or_else(|| HookError::Crypto("no crypto backend configured".to_string()))
    }
}

#[async_trait]
impl Rules for ConfigRules {
    async fn transform(&self, message: &mut Message) -> HookResult<()> {
        if let Some(trigger) = message.rule_trigger() {
            internal!(level = DEBUG, "Message carries rule trigger '{}'", trigger);
        }

        for key in &self.settings.remove_headers {
            message.remove_header(key);
        }

        for header in &self.settings.add_headers {
            message.add_header(&header.key, &header.value);
        }

        if let Some(footer) = &self.settings.footer {
            message.append_body(footer);
        }

        if self.settings.sign {
            message.body = self.crypto()?.sign(&message.body)?;
        }

        if self.settings.encrypt {
            let recipients = message.recipients();
            message.body = self.crypto()?.encrypt(&message.body, &recipients)?;
        }

        Ok(())
    }
}
