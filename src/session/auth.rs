use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::{
    error::{HookError, SessionError, SessionResult},
    hooks::AuthOutcome,
    internal,
    smtp::{ClientCommand, Status},
};

impl<Client, Upstream> Session<Client, Upstream>
where
    Client: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    Upstream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Authenticate the client locally. The upstream never sees the
    /// exchange.
    pub(super) async fn handle_auth(&mut self, command: &ClientCommand) -> SessionResult<()> {
        if self.authenticated_user.is_some() {
            return self
                .respond(Status::InvalidCommandSequence, "5.5.1 Already authenticated")
                .await;
        }

        let mut arguments = command.argument().split_whitespace();
        let Some(mechanism) = arguments.next() else {
            return self
                .respond(Status::SyntaxError, "5.5.4 Syntax: AUTH mechanism")
                .await;
        };
        let initial = arguments.next();

        let auth = Arc::clone(&self.hooks.auth);
        if !auth
            .mechanisms()
            .iter()
            .any(|offered| offered.eq_ignore_ascii_case(mechanism))
        {
            return self
                .respond(
                    Status::ParameterNotImplemented,
                    "5.5.4 Unrecognized authentication type",
                )
                .await;
        }

        let (status, text) = match auth.authenticate(mechanism, initial, &mut self.client).await {
            Ok(AuthOutcome::Success(user)) => {
                internal!(level = INFO, "Client authenticated as {}", user);
                self.authenticated_user = Some(user);
                (Status::AuthSucceeded, "2.7.0 Authentication successful")
            }
            Ok(AuthOutcome::Failure) => {
                tracing::warn!(mechanism, "Client authentication failed");
                (Status::AuthFailed, "5.7.8 Authentication credentials invalid")
            }
            Ok(AuthOutcome::Aborted) => (Status::SyntaxError, "5.7.0 Authentication aborted"),
            Ok(AuthOutcome::Malformed) => (Status::SyntaxError, "5.5.2 Cannot decode response"),
            Ok(AuthOutcome::Unsupported) => (
                Status::ParameterNotImplemented,
                "5.5.4 Unrecognized authentication type",
            ),
            Err(HookError::Connection(err)) => return Err(SessionError::Client(err)),
            Err(err) => {
                tracing::warn!("Authentication backend failed: {err}");
                self.flags.error = true;
                (Status::TemporaryFailure, "4.7.0 Temporary authentication failure")
            }
        };

        self.respond(status, text).await
    }
}
