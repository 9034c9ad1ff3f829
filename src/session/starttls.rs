use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::{
    error::{SessionError, SessionResult},
    smtp::Status,
    transport::tls,
};

/// How far a client STARTTLS got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPhase {
    /// Both legs are still plaintext.
    Plain,
    /// The upstream was asked to start TLS.
    UpstreamUpgrading,
    /// The upstream leg is TLS; the client handshake is next.
    ClientUpgrading,
    /// TLS is in place.
    Done,
    /// TLS is not offered on this session.
    Unavailable,
}

impl<Client, Upstream> Session<Client, Upstream>
where
    Client: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    Upstream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Handle a client STARTTLS. Unless the upstream is a local MTA, the
    /// upstream leg is upgraded first, then the client leg.
    ///
    /// Failures short of a lost connection are answered and leave the
    /// session running in whatever state the legs ended up in.
    pub(super) async fn handle_starttls(&mut self) -> SessionResult<TlsPhase> {
        if self.flags.tls_finished {
            let text = if self.flags.tls_oneway {
                "5.0.0 TLS (ONEWAY) already started"
            } else {
                "5.0.0 TLS already started"
            };
            self.respond(Status::InvalidCommandSequence, text).await?;
            return Ok(TlsPhase::Done);
        }

        if !self.flags.tls_enabled || !self.flags.has_tls_capability {
            self.respond(Status::InvalidCommandSequence, "5.5.0 TLS not available")
                .await?;
            return Ok(TlsPhase::Unavailable);
        }

        // Key material is checked before either leg is touched, so a broken
        // certificate never leaves the upstream upgraded on its own.
        let acceptor = match tls::acceptor(&self.config.tls) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                tracing::warn!("Unable to prepare TLS for the client: {err}");
                self.flags.error = true;
                self.respond(
                    Status::TemporaryFailure,
                    "TLS not available due to temporary reason",
                )
                .await?;
                return Ok(TlsPhase::Plain);
            }
        };

        let mut phase = TlsPhase::Plain;

        if !self.flags.local_mta {
            phase = TlsPhase::UpstreamUpgrading;
            self.upstream
                .send("STARTTLS")
                .await
                .map_err(SessionError::Upstream)?;
            let reply = self.upstream_reply().await?;

            if !reply.is_positive() {
                tracing::warn!("STARTTLS refused by the upstream: {reply}");
                self.flags.error = true;
                self.reply(&reply).await?;
                return Ok(TlsPhase::Plain);
            }

            if let Err(err) = self.upgrade_upstream().await {
                tracing::warn!("TLS towards the upstream failed: {err}");
                self.flags.error = true;
                self.respond(Status::TemporaryFailure, "4.3.3 TLS not available")
                    .await?;
                return Ok(phase);
            }

            self.flags.upstream_authenticated = false;
        }

        phase = TlsPhase::ClientUpgrading;
        self.respond(Status::ServiceReady, "2.0.0 Ready to start TLS")
            .await?;

        if let Err(err) = self.client.upgrade_server(&acceptor).await {
            tracing::warn!("TLS towards the client failed: {err}");
            self.flags.error = true;
            self.respond(Status::TemporaryFailure, "4.3.3 TLS not available")
                .await?;
            return Ok(phase);
        }

        // Nothing learned before the handshake carries over.
        self.message.reset();
        self.flags.tls_finished = true;
        Ok(TlsPhase::Done)
    }
}
