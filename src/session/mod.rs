//! One relayed SMTP conversation.
//!
//! A [`Session`] sits between a client and its upstream MTA and keeps the
//! two in lock-step: every client command is answered by exactly one reply,
//! which normally is the upstream's reply relayed verbatim. The session
//! steps in for the commands that change the shape of the connection
//! (EHLO, STARTTLS, AUTH) and for the message body after DATA, which is
//! collected, handed to the rules and re-serialized.

mod auth;
pub mod collector;
mod data;
mod ehlo;
mod starttls;
pub mod transmitter;

use core::future::Future;
use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{timeout, timeout_at, Instant},
};
use tracing::Instrument;

pub use self::starttls::TlsPhase;
use crate::{
    config::Config,
    error::{ConnectionError, SessionError, SessionResult},
    hooks::Hooks,
    internal,
    smtp::{ClientCommand, Message, Reply, Status, Verb},
    transport::{Leg, Transport},
};

/// Name used in the rewritten greeting.
pub const VERSION: &str = concat!("smtp-tunnel ", env!("CARGO_PKG_VERSION"));

/// Per-session state that shapes how commands are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct SessionFlags {
    /// TLS towards the client is configured.
    pub tls_enabled: bool,
    /// The upstream advertised STARTTLS (or the tunnel offers it itself in
    /// local MTA mode).
    pub has_tls_capability: bool,
    /// A TLS upgrade has completed; a second STARTTLS is refused.
    pub tls_finished: bool,
    /// Upstream-only TLS is configured and has not failed.
    pub tls_oneway: bool,
    /// The tunnel logs in to the upstream on the client's behalf.
    pub esmtp_auth_enabled: bool,
    /// The tunnel has logged in to the upstream on the current connection.
    pub upstream_authenticated: bool,
    /// The upstream is a local MTA; STARTTLS is never sent to it.
    pub local_mta: bool,
    /// MIME structure is ignored; the whole body is collected.
    pub collect_entire_body: bool,
    /// Something went wrong that did not end the session.
    pub error: bool,
}

impl SessionFlags {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            tls_enabled: config.tls.enabled,
            tls_oneway: config.tls.oneway,
            esmtp_auth_enabled: config.tunnel.esmtp_auth,
            local_mta: config.tunnel.local_mta,
            collect_entire_body: config.tunnel.collect_entire_body,
            ..Self::default()
        }
    }
}

/// The overall deadline for collecting and transmitting one message.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    #[must_use]
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    /// Run `future` to completion unless the deadline passes first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DataTimeout`] when the deadline passes.
    pub async fn run<F: Future>(&self, future: F) -> SessionResult<F::Output> {
        timeout_at(self.at, future)
            .await
            .map_err(|_| SessionError::DataTimeout(self.limit.as_secs()))
    }
}

pub struct Session<Client, Upstream>
where
    Client: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    Upstream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    client: Transport<Client>,
    upstream: Transport<Upstream>,
    flags: SessionFlags,
    message: Message,
    ehlo_domain: Option<String>,
    authenticated_user: Option<String>,
    peer: Option<SocketAddr>,
    config: Arc<Config>,
    hooks: Hooks,
}

impl<Client, Upstream> Session<Client, Upstream>
where
    Client: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    Upstream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    pub fn new(client: Client, upstream: Upstream, config: Arc<Config>, hooks: Hooks) -> Self {
        Self {
            client: Transport::new(client, Leg::Client),
            upstream: Transport::new(upstream, Leg::Upstream),
            flags: SessionFlags::from_config(&config),
            message: Message::new(),
            ehlo_domain: config.tunnel.ehlo_domain.clone(),
            authenticated_user: None,
            peer: None,
            config,
            hooks,
        }
    }

    #[must_use]
    pub const fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    #[must_use]
    pub const fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Relay until either side hangs up, the client quits, or a leg fails.
    /// Both connections are closed on return.
    ///
    /// # Errors
    ///
    /// Returns the fault that ended the session. The client has already been
    /// sent the matching `421` reply where one was deliverable.
    pub async fn run(mut self) -> SessionResult<()> {
        let span = tracing::info_span!(
            target: crate::logging::TARGET,
            "session",
            peer = ?self.peer
        );

        async move {
            internal!(level = INFO, "Session started");
            let result = self.relay().await;

            if let Err(err) = &result {
                tracing::warn!("Session ended: {err}");
                if let Some(reply) = err.final_reply() {
                    if let Err(err) = self.client.send(reply).await {
                        internal!(level = DEBUG, "Unable to send final reply: {}", err);
                    }
                }
            }

            self.client.close().await;
            self.upstream.close().await;

            internal!(
                level = INFO,
                "Session finished (errors: {})",
                self.flags.error || result.is_err()
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn relay(&mut self) -> SessionResult<()> {
        self.greet().await?;

        while let Some(line) = self.read_command().await? {
            let command = ClientCommand::parse(&line);
            self.record(&command);

            let keep_going = match command.verb() {
                Verb::StartTls => {
                    let phase = self.handle_starttls().await?;
                    internal!(level = DEBUG, "STARTTLS ended in phase {:?}", phase);
                    true
                }
                Verb::XDatabase => {
                    let answer = self.hooks.rules.xdatabase(command.argument()).await;
                    match answer {
                        Some(reply) => {
                            self.reply(&reply).await?;
                            true
                        }
                        None => self.transfer_command(&command).await?,
                    }
                }
                Verb::Auth if !self.hooks.auth.mechanisms().is_empty() => {
                    self.handle_auth(&command).await?;
                    true
                }
                _ => self.transfer_command(&command).await?,
            };

            if !keep_going {
                break;
            }
        }

        Ok(())
    }

    /// Relay the upstream greeting, optionally naming the tunnel in it.
    async fn greet(&mut self) -> SessionResult<()> {
        let mut banner = self.upstream_reply().await?;
        if self.config.tunnel.rewrite_banner {
            banner.rewrite_banner(VERSION);
        }

        self.reply(&banner).await
    }

    /// Keep the command for rule matching. AUTH arguments carry credentials,
    /// so only the mechanism is kept.
    fn record(&mut self, command: &ClientCommand) {
        let mut record = command.record();
        if command.verb() == Verb::Auth {
            record.value = record
                .value
                .and_then(|value| value.split_whitespace().next().map(str::to_string));
        }

        self.message.record(record);
    }

    /// Forward a command, relay the reply, and act on a positive one.
    /// Returns `false` once the conversation is over.
    async fn transfer_command(&mut self, command: &ClientCommand) -> SessionResult<bool> {
        let reply = if command.verb() == Verb::Ehlo {
            self.negotiate_ehlo(command).await?
        } else {
            self.upstream
                .send(command.forward_line())
                .await
                .map_err(SessionError::Upstream)?;
            self.upstream_reply().await?
        };

        self.reply(&reply).await?;

        if reply.is_positive() {
            match command.verb() {
                Verb::Quit => return Ok(false),
                Verb::Rset => self.message.reset(),
                Verb::Data => self.process_data().await?,
                _ => {}
            }
        }

        Ok(true)
    }

    /// Wait for the next client command. `None` when the client hung up.
    async fn read_command(&mut self) -> SessionResult<Option<Vec<u8>>> {
        let limit = self.config.timeouts.command_timeout();

        timeout(limit, self.client.read_line())
            .await
            .map_err(|_| SessionError::Idle(limit.as_secs()))?
            .map_err(SessionError::Client)
    }

    /// Read one complete upstream reply within the reply timeout.
    async fn upstream_reply(&mut self) -> SessionResult<Reply> {
        let limit = self.config.timeouts.reply_timeout();

        timeout(limit, self.upstream.read_reply())
            .await
            .map_err(|_| SessionError::Upstream(ConnectionError::Timeout(limit.as_secs())))?
            .map_err(SessionError::Upstream)
    }

    async fn reply(&mut self, reply: &Reply) -> SessionResult<()> {
        self.client
            .send_reply(reply)
            .await
            .map_err(SessionError::Client)
    }

    async fn respond(&mut self, status: Status, text: &str) -> SessionResult<()> {
        self.reply(&Reply::new(status, text)).await
    }
}
