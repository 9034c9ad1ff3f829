//! SMTP AUTH on both legs.
//!
//! Towards clients the tunnel can act as a SASL server for `PLAIN` and
//! `LOGIN`. Towards the upstream it can log in with configured credentials
//! using whichever of the two the upstream advertises.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::LineChannel;
use crate::{
    config::AuthSettings,
    error::{HookError, HookResult},
    internal,
};

/// How a client authentication attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The client proved to be this user.
    Success(String),
    /// Wrong credentials.
    Failure,
    /// The client cancelled with `*`.
    Aborted,
    /// A response was not valid base64 or not a valid SASL message.
    Malformed,
    /// The mechanism is not offered.
    Unsupported,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Mechanisms offered to clients. Empty leaves AUTH to the upstream.
    fn mechanisms(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run a client authentication exchange. Challenges are sent over
    /// `client`; the final reply is left to the caller.
    async fn authenticate(
        &self,
        mechanism: &str,
        initial: Option<&str>,
        client: &mut dyn LineChannel,
    ) -> HookResult<AuthOutcome>;

    /// Log in to the upstream, given the mechanism list it advertised.
    /// Returns a capability line (`AUTH ...`) to advertise to the client in
    /// place of the upstream's, if any.
    async fn relay_auth(
        &self,
        mechanisms: &str,
        upstream: &mut dyn LineChannel,
    ) -> HookResult<Option<String>>;
}

/// No authentication: client AUTH goes upstream, the tunnel never logs in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn authenticate(
        &self,
        _mechanism: &str,
        _initial: Option<&str>,
        _client: &mut dyn LineChannel,
    ) -> HookResult<AuthOutcome> {
        Ok(AuthOutcome::Unsupported)
    }

    async fn relay_auth(
        &self,
        _mechanisms: &str,
        _upstream: &mut dyn LineChannel,
    ) -> HookResult<Option<String>> {
        Ok(None)
    }
}

/// Credentials from the configuration file.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    username: Option<String>,
    password: Option<String>,
    users: BTreeMap<String, String>,
}

impl From<&AuthSettings> for StaticAuthenticator {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            username: settings.username.clone(),
            password: settings.password.clone(),
            users: settings.users.clone(),
        }
    }
}

const USERNAME_CHALLENGE: &str = "334 VXNlcm5hbWU6";
const PASSWORD_CHALLENGE: &str = "334 UGFzc3dvcmQ6";

enum Response {
    Cancelled,
    Decoded(Vec<u8>),
    Invalid,
}

fn decode(line: &str) -> Response {
    match line.trim() {
        "*" => Response::Cancelled,
        "=" => Response::Decoded(Vec::new()),
        encoded => STANDARD
            .decode(encoded)
            .map_or(Response::Invalid, Response::Decoded),
    }
}

async fn challenge(client: &mut dyn LineChannel, prompt: &str) -> HookResult<Response> {
    client.send_line(prompt).await?;
    Ok(decode(&client.receive_line().await?))
}

impl StaticAuthenticator {
    fn verify(&self, username: &str, password: &str) -> AuthOutcome {
        match self.users.get(username) {
            Some(expected) if expected == password => AuthOutcome::Success(username.to_string()),
            _ => AuthOutcome::Failure,
        }
    }

    async fn plain(
        &self,
        initial: Option<&str>,
        client: &mut dyn LineChannel,
    ) -> HookResult<AuthOutcome> {
        let response = match initial {
            Some(initial) => decode(initial),
            None => challenge(client, "334 ").await?,
        };

        let message = match response {
            Response::Cancelled => return Ok(AuthOutcome::Aborted),
            Response::Invalid => return Ok(AuthOutcome::Malformed),
            Response::Decoded(message) => message,
        };

        // authzid NUL authcid NUL passwd
        let parts: Vec<&[u8]> = message.split(|b| *b == 0).collect();
        let [_authzid, authcid, passwd] = parts.as_slice() else {
            return Ok(AuthOutcome::Malformed);
        };

        match (std::str::from_utf8(authcid), std::str::from_utf8(passwd)) {
            (Ok(username), Ok(password)) => Ok(self.verify(username, password)),
            _ => Ok(AuthOutcome::Malformed),
        }
    }

    async fn login(
        &self,
        initial: Option<&str>,
        client: &mut dyn LineChannel,
    ) -> HookResult<AuthOutcome> {
        let username = match initial {
            Some(initial) => decode(initial),
            None => challenge(client, USERNAME_CHALLENGE).await?,
        };
        let username = match username {
            Response::Cancelled => return Ok(AuthOutcome::Aborted),
            Response::Invalid => return Ok(AuthOutcome::Malformed),
            Response::Decoded(username) => username,
        };

        let password = match challenge(client, PASSWORD_CHALLENGE).await? {
            Response::Cancelled => return Ok(AuthOutcome::Aborted),
            Response::Invalid => return Ok(AuthOutcome::Malformed),
            Response::Decoded(password) => password,
        };

        match (String::from_utf8(username), String::from_utf8(password)) {
            (Ok(username), Ok(password)) => Ok(self.verify(&username, &password)),
            _ => Ok(AuthOutcome::Malformed),
        }
    }

    fn credentials(&self) -> HookResult<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok((username, password)),
            _ => Err(HookError::Auth(
                "no upstream credentials configured".to_string(),
            )),
        }
    }
}

async fn expect_code(upstream: &mut dyn LineChannel, code: u16) -> HookResult<()> {
    let reply = upstream.receive_reply().await?;
    if reply.code() == Some(code) {
        Ok(())
    } else {
        Err(HookError::Auth(format!("upstream replied {reply}")))
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    fn mechanisms(&self) -> Vec<String> {
        if self.users.is_empty() {
            Vec::new()
        } else {
            vec!["PLAIN".to_string(), "LOGIN".to_string()]
        }
    }

    async fn authenticate(
        &self,
        mechanism: &str,
        initial: Option<&str>,
        client: &mut dyn LineChannel,
    ) -> HookResult<AuthOutcome> {
        if self.users.is_empty() {
            return Ok(AuthOutcome::Unsupported);
        }

        match mechanism.to_ascii_uppercase().as_str() {
            "PLAIN" => self.plain(initial, client).await,
            "LOGIN" => self.login(initial, client).await,
            _ => Ok(AuthOutcome::Unsupported),
        }
    }

    async fn relay_auth(
        &self,
        mechanisms: &str,
        upstream: &mut dyn LineChannel,
    ) -> HookResult<Option<String>> {
        let (username, password) = self.credentials()?;
        let offered = |name: &str| {
            mechanisms
                .split_whitespace()
                .any(|mechanism| mechanism.eq_ignore_ascii_case(name))
        };

        if offered("PLAIN") {
            let token = STANDARD.encode(format!("\0{username}\0{password}"));
            upstream.send_line(&format!("AUTH PLAIN {token}")).await?;
            expect_code(upstream, 235).await?;
        } else if offered("LOGIN") {
            upstream.send_line("AUTH LOGIN").await?;
            expect_code(upstream, 334).await?;
            upstream.send_line(&STANDARD.encode(username)).await?;
            expect_code(upstream, 334).await?;
            upstream.send_line(&STANDARD.encode(password)).await?;
            expect_code(upstream, 235).await?;
        } else {
            return Err(HookError::Auth(format!(
                "no supported mechanism in '{mechanisms}'"
            )));
        }

        internal!(level = INFO, "Authenticated to upstream as {}", username);

        let local = self.mechanisms();
        Ok((!local.is_empty()).then(|| format!("AUTH {}", local.join(" "))))
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::{ConnectionError, ConnectionResult},
        smtp::Reply,
    };

    /// Scripted peer: pops canned input, records everything sent.
    #[derive(Default)]
    struct Script {
        input: VecDeque<String>,
        sent: Vec<String>,
    }

    impl Script {
        fn new<I, S>(input: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                input: input.into_iter().map(Into::into).collect(),
                sent: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl LineChannel for Script {
        async fn send_line(&mut self, line: &str) -> ConnectionResult<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        async fn receive_line(&mut self) -> ConnectionResult<String> {
            self.input.pop_front().ok_or(ConnectionError::Closed)
        }

        async fn receive_reply(&mut self) -> ConnectionResult<Reply> {
            let line = self.receive_line().await?;
            Ok(Reply::from_lines([line]))
        }
    }

    fn authenticator() -> StaticAuthenticator {
        StaticAuthenticator::from(&AuthSettings {
            username: Some("relay".to_string()),
            password: Some("secret".to_string()),
            users: BTreeMap::from([("alice".to_string(), "wonderland".to_string())]),
        })
    }

    #[tokio::test]
    async fn plain_with_initial_response() {
        let auth = authenticator();
        let mut client = Script::default();

        let initial = STANDARD.encode("\0alice\0wonderland");
        assert_eq!(
            auth.authenticate("plain", Some(&initial), &mut client)
                .await
                .unwrap(),
            AuthOutcome::Success("alice".to_string())
        );
        assert!(client.sent.is_empty());

        let wrong = STANDARD.encode("\0alice\0rabbit");
        assert_eq!(
            auth.authenticate("PLAIN", Some(&wrong), &mut client)
                .await
                .unwrap(),
            AuthOutcome::Failure
        );
    }

    #[tokio::test]
    async fn plain_with_challenge() {
        let auth = authenticator();
        let mut client = Script::new([STANDARD.encode("\0alice\0wonderland")]);

        assert_eq!(
            auth.authenticate("PLAIN", None, &mut client).await.unwrap(),
            AuthOutcome::Success("alice".to_string())
        );
        assert_eq!(client.sent, vec!["334 ".to_string()]);
    }

    #[tokio::test]
    async fn login_exchange() {
        let auth = authenticator();
        let mut client = Script::new(["YWxpY2U=", "d29uZGVybGFuZA=="]);

        assert_eq!(
            auth.authenticate("LOGIN", None, &mut client).await.unwrap(),
            AuthOutcome::Success("alice".to_string())
        );
        assert_eq!(
            client.sent,
            vec![USERNAME_CHALLENGE.to_string(), PASSWORD_CHALLENGE.to_string()]
        );
    }

    #[tokio::test]
    async fn aborted_and_malformed() {
        let auth = authenticator();

        let mut client = Script::new(["*"]);
        assert_eq!(
            auth.authenticate("LOGIN", None, &mut client).await.unwrap(),
            AuthOutcome::Aborted
        );

        let mut client = Script::new(["not base64!"]);
        assert_eq!(
            auth.authenticate("PLAIN", None, &mut client).await.unwrap(),
            AuthOutcome::Malformed
        );

        let mut client = Script::default();
        let missing_separator = STANDARD.encode("alice");
        assert_eq!(
            auth.authenticate("PLAIN", Some(&missing_separator), &mut client)
                .await
                .unwrap(),
            AuthOutcome::Malformed
        );

        assert_eq!(
            auth.authenticate("CRAM-MD5", None, &mut client)
                .await
                .unwrap(),
            AuthOutcome::Unsupported
        );
    }

    #[tokio::test]
    async fn client_disconnects_mid_exchange() {
        let auth = authenticator();
        let mut client = Script::default();

        assert!(matches!(
            auth.authenticate("LOGIN", None, &mut client).await,
            Err(HookError::Connection(ConnectionError::Closed))
        ));
    }

    #[tokio::test]
    async fn relay_prefers_plain() {
        let auth = authenticator();
        let mut upstream = Script::new(["235 2.7.0 Authentication successful"]);

        let advertised = auth
            .relay_auth("LOGIN PLAIN", &mut upstream)
            .await
            .unwrap();
        assert_eq!(advertised.as_deref(), Some("AUTH PLAIN LOGIN"));
        assert_eq!(
            upstream.sent,
            vec![format!("AUTH PLAIN {}", STANDARD.encode("\0relay\0secret"))]
        );
    }

    #[tokio::test]
    async fn relay_with_login() {
        let auth = authenticator();
        let mut upstream = Script::new([
            "334 VXNlcm5hbWU6",
            "334 UGFzc3dvcmQ6",
            "235 2.7.0 Authentication successful",
        ]);

        auth.relay_auth("LOGIN", &mut upstream).await.unwrap();
        assert_eq!(
            upstream.sent,
            vec![
                "AUTH LOGIN".to_string(),
                STANDARD.encode("relay"),
                STANDARD.encode("secret")
            ]
        );
    }

    #[tokio::test]
    async fn relay_failures() {
        let auth = authenticator();

        let mut upstream = Script::new(["535 5.7.8 Authentication credentials invalid"]);
        assert!(matches!(
            auth.relay_auth("PLAIN", &mut upstream).await,
            Err(HookError::Auth(_))
        ));

        let mut upstream = Script::default();
        assert!(matches!(
            auth.relay_auth("CRAM-MD5 GSSAPI", &mut upstream).await,
            Err(HookError::Auth(_))
        ));

        let no_credentials = StaticAuthenticator::default();
        assert!(matches!(
            no_credentials.relay_auth("PLAIN", &mut upstream).await,
            Err(HookError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn no_auth() {
        let mut channel = Script::default();
        assert!(NoAuth.mechanisms().is_empty());
        assert_eq!(
            NoAuth.authenticate("PLAIN", None, &mut channel).await.unwrap(),
            AuthOutcome::Unsupported
        );
        assert_eq!(NoAuth.relay_auth("PLAIN", &mut channel).await.unwrap(), None);
    }
}
