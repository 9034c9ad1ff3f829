use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    collector::{collect_body, collect_headers, CollectOptions, Progress},
    transmitter::{transfer_body, transfer_header},
    Deadline, Session,
};
use crate::{
    error::{ConnectionError, SessionError, SessionResult},
    internal,
};

impl<Client, Upstream> Session<Client, Upstream>
where
    Client: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    Upstream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Collect, rewrite and transmit one message, then relay the upstream's
    /// verdict. Everything from the first data line to the final reply runs
    /// under one deadline.
    pub(super) async fn process_data(&mut self) -> SessionResult<()> {
        let deadline = Deadline::after(self.config.timeouts.data_timeout());
        let options = CollectOptions {
            entire_body: self.flags.collect_entire_body,
            trigger: &self.config.tunnel.trigger,
        };

        let mut progress =
            collect_headers(&mut self.client, &mut self.message, &options, &deadline).await?;
        if progress == Progress::Continue {
            progress = collect_body(&mut self.client, &mut self.message, &deadline).await?;
        }

        // A message cut short must not reach the upstream with a terminator.
        if progress == Progress::Closed {
            return Err(SessionError::Client(ConnectionError::Closed));
        }

        internal!(
            level = DEBUG,
            "Collected {} headers, {} body bytes (boundary: {:?})",
            self.message.headers.len(),
            self.message.body.len(),
            self.message.boundary
        );

        // A failed rule leaves the message as collected.
        let rules = self.hooks.rules.clone();
        let mut rewritten = self.message.clone();
        match deadline.run(rules.transform(&mut rewritten)).await? {
            Ok(()) => self.message = rewritten,
            Err(err) => {
                tracing::warn!("Rules failed, sending the message unchanged: {err}");
                self.flags.error = true;
            }
        }

        transfer_header(&mut self.upstream, &self.message)
            .await
            .map_err(SessionError::Upstream)?;
        transfer_body(
            &mut self.upstream,
            &mut self.client,
            &self.message,
            self.config.tunnel.mode,
            &deadline,
        )
        .await?;

        let reply = deadline
            .run(self.upstream.read_reply())
            .await?
            .map_err(SessionError::Upstream)?;
        self.reply(&reply).await?;

        self.message.reset();
        Ok(())
    }
}
