//! EHLO negotiation.
//!
//! The upstream's capability list is what the client sees, minus what the
//! tunnel cannot pass through (STARTTLS when the client leg will not do
//! TLS, AUTH when the tunnel logs in itself) and plus what the tunnel adds
//! (rule capabilities, local AUTH). With upstream-only TLS the upgrade
//! happens here, before the client has seen the reply.

use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};

use super::Session;
use crate::{
    error::{ConnectionError, HookError, SessionError, SessionResult, TlsResult},
    internal,
    smtp::{ClientCommand, Reply},
    transport::tls,
};

const STARTTLS: &str = "STARTTLS";

impl<Client, Upstream> Session<Client, Upstream>
where
    Client: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    Upstream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// The domain for upstream EHLOs: the configured one, else the first one
    /// a client sent.
    fn ehlo_domain(&mut self, command: &ClientCommand) -> String {
        self.ehlo_domain
            .get_or_insert_with(|| command.argument().to_string())
            .clone()
    }

    async fn send_ehlo(&mut self, domain: &str) -> SessionResult<Reply> {
        self.upstream
            .send(format!("EHLO {domain}"))
            .await
            .map_err(SessionError::Upstream)?;
        self.upstream_reply().await
    }

    /// Forward an EHLO and produce the reply the client should see.
    pub(super) async fn negotiate_ehlo(&mut self, command: &ClientCommand) -> SessionResult<Reply> {
        let domain = self.ehlo_domain(command);
        let mut reply = self.send_ehlo(&domain).await?;

        if !reply.is_positive() {
            return Ok(reply);
        }

        if reply.has_capability(STARTTLS) {
            self.flags.has_tls_capability = true;
        }

        if self.flags.tls_oneway && self.flags.has_tls_capability && !self.flags.tls_finished {
            if let Some(upgraded) = self.oneway_upgrade(&domain).await? {
                reply = upgraded;
            }
        }

        reply.append_capabilities(self.hooks.rules.capabilities());
        self.filter_starttls(&mut reply);
        self.filter_auth(&mut reply).await?;

        Ok(reply)
    }

    /// Offer STARTTLS only when the client leg can actually be upgraded.
    fn filter_starttls(&mut self, reply: &mut Reply) {
        let flags = &mut self.flags;

        if flags.has_tls_capability && (!flags.tls_enabled || flags.tls_oneway || flags.tls_finished)
        {
            reply.remove_capability(STARTTLS);
        }

        if flags.local_mta
            && flags.tls_enabled
            && !flags.tls_oneway
            && !flags.tls_finished
            && !reply.has_capability(STARTTLS)
        {
            reply.append_capabilities([STARTTLS]);
            flags.has_tls_capability = true;
        }
    }

    async fn filter_auth(&mut self, reply: &mut Reply) -> SessionResult<()> {
        let mechanisms = self.hooks.auth.mechanisms();
        let local = (!mechanisms.is_empty()).then(|| format!("AUTH {}", mechanisms.join(" ")));

        if self.flags.esmtp_auth_enabled {
            if let Some((index, offered)) = reply.take_auth() {
                let advertised = if self.flags.upstream_authenticated {
                    local
                } else {
                    self.relay_auth(&offered).await?.or(local)
                };

                if let Some(line) = advertised {
                    reply.insert_capabilities(index, [line]);
                }
                return Ok(());
            }
        }

        if let Some(line) = local {
            reply.remove_capability("AUTH");
            reply.append_capabilities([line]);
        }

        Ok(())
    }

    /// Log in to the upstream. A refused login is not fatal; losing the
    /// connection during it, or waiting longer than the reply timeout, is.
    async fn relay_auth(&mut self, offered: &str) -> SessionResult<Option<String>> {
        let auth = Arc::clone(&self.hooks.auth);
        let limit = self.config.timeouts.reply_timeout();

        let result = timeout(limit, auth.relay_auth(offered, &mut self.upstream))
            .await
            .map_err(|_| SessionError::Upstream(ConnectionError::Timeout(limit.as_secs())))?;

        match result {
            Ok(line) => {
                self.flags.upstream_authenticated = true;
                internal!(level = INFO, "Authenticated to the upstream");
                Ok(line)
            }
            Err(HookError::Connection(err)) => Err(SessionError::Upstream(err)),
            Err(err) => {
                tracing::warn!("Upstream authentication failed: {err}");
                self.flags.error = true;
                Ok(None)
            }
        }
    }

    /// Upgrade only the upstream leg, then re-issue EHLO over TLS. Returns the
    /// new reply, or `None` when the upgrade failed and the session falls
    /// back to plaintext for good.
    async fn oneway_upgrade(&mut self, domain: &str) -> SessionResult<Option<Reply>> {
        internal!(level = INFO, "Using TLS towards the upstream only");

        self.upstream
            .send(STARTTLS)
            .await
            .map_err(SessionError::Upstream)?;
        let response = self.upstream_reply().await?;

        if !response.is_positive() {
            tracing::warn!("STARTTLS (ONEWAY) refused by the upstream: {response}");
            self.flags.tls_oneway = false;
            self.flags.error = true;
            return Ok(None);
        }

        if let Err(err) = self.upgrade_upstream().await {
            tracing::warn!("TLS (ONEWAY) towards the upstream failed: {err}");
            self.flags.tls_oneway = false;
            self.flags.error = true;
            return Ok(None);
        }

        self.flags.tls_finished = true;
        self.flags.upstream_authenticated = false;

        self.send_ehlo(domain).await.map(Some)
    }

    /// TLS client handshake on the upstream leg.
    pub(super) async fn upgrade_upstream(&mut self) -> TlsResult<()> {
        let connector = tls::connector(&self.config.tls)?;
        self.upstream
            .upgrade_client(&connector, self.config.upstream.server_name())
            .await
    }
}
