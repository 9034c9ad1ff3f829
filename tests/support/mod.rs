//! Test harness: a scripted upstream MTA, a running tunnel and a line-level
//! SMTP client.
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use smtp_tunnel::{
    config::{Config, TlsSettings},
    hooks::Hooks,
    listener::Listener,
    transport::tls,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};
use tokio_rustls::{client::TlsStream, rustls::pki_types::ServerName, TlsAcceptor};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// TLS settings for the fixture certificate, trusted as its own CA.
pub fn fixture_tls() -> TlsSettings {
    TlsSettings {
        certificate: Some(fixture("cert.pem")),
        key: Some(fixture("key.pem")),
        ca_file: Some(fixture("cert.pem")),
        check_key_permissions: false,
        ..TlsSettings::default()
    }
}

/// What the mock upstream saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A command line, without its line ending.
    Command(String),
    /// The data section of a message, without the terminator.
    Message(String),
    /// The connection was upgraded to TLS.
    Tls,
}

#[derive(Clone)]
struct MockConfig {
    greeting: String,
    capabilities: Vec<String>,
    data_end_response: String,
    tls: Option<TlsAcceptor>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            greeting: "220 mx.example.com ESMTP Mock".to_string(),
            capabilities: vec!["mx.example.com".to_string(), "SIZE 10000".to_string()],
            data_end_response: "250 2.0.0 OK: Message accepted".to_string(),
            tls: None,
        }
    }
}

enum Outcome<S> {
    Closed,
    Upgrade(S),
}

/// Mock upstream MTA for testing the tunnel
pub struct MockUpstream {
    addr: SocketAddr,
    received: Arc<RwLock<Vec<Received>>>,
}

impl MockUpstream {
    #[must_use]
    pub fn builder() -> MockUpstreamBuilder {
        MockUpstreamBuilder {
            config: MockConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn received(&self) -> Vec<Received> {
        self.received.read().await.clone()
    }

    /// The command lines received, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.received()
            .await
            .into_iter()
            .filter_map(|received| match received {
                Received::Command(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// The message data sections received, in order.
    pub async fn messages(&self) -> Vec<String> {
        self.received()
            .await
            .into_iter()
            .filter_map(|received| match received {
                Received::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    async fn handle_client(
        stream: TcpStream,
        config: Arc<MockConfig>,
        received: Arc<RwLock<Vec<Received>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Outcome::Upgrade(stream) = converse(stream, &config, &received, false).await? else {
            return Ok(());
        };

        let Some(acceptor) = config.tls.as_ref() else {
            return Ok(());
        };
        let stream = acceptor.accept(stream).await?;
        received.write().await.push(Received::Tls);

        converse(stream, &config, &received, true).await?;
        Ok(())
    }
}

async fn converse<S>(
    stream: S,
    config: &MockConfig,
    received: &RwLock<Vec<Received>>,
    tls: bool,
) -> std::io::Result<Outcome<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut line = String::new();

    if !tls {
        stream
            .write_all(format!("{}\r\n", config.greeting).as_bytes())
            .await?;
    }

    loop {
        line.clear();
        match timeout(READ_TIMEOUT, stream.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => return Ok(Outcome::Closed),
            Ok(result) => result?,
        };

        let command = line.trim_end().to_string();
        received.write().await.push(Received::Command(command.clone()));
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();

        let response = match verb.as_str() {
            "EHLO" => {
                let mut capabilities = config.capabilities.clone();
                if config.tls.is_some() && !tls {
                    capabilities.push("STARTTLS".to_string());
                }

                let last = capabilities.len() - 1;
                capabilities
                    .iter()
                    .enumerate()
                    .map(|(index, capability)| {
                        let separator = if index == last { ' ' } else { '-' };
                        format!("250{separator}{capability}\r\n")
                    })
                    .collect()
            }
            "STARTTLS" if config.tls.is_some() && !tls => {
                stream.write_all(b"220 2.0.0 Ready to start TLS\r\n").await?;
                return Ok(Outcome::Upgrade(stream.into_inner()));
            }
            "DATA" => {
                stream.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;

                let mut message = String::new();
                loop {
                    line.clear();
                    if stream.read_line(&mut line).await? == 0 {
                        return Ok(Outcome::Closed);
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    message.push_str(&line);
                }

                received.write().await.push(Received::Message(message));
                format!("{}\r\n", config.data_end_response)
            }
            "QUIT" => {
                stream.write_all(b"221 2.0.0 Bye\r\n").await?;
                return Ok(Outcome::Closed);
            }
            "AUTH" => "235 2.7.0 Authentication successful\r\n".to_string(),
            "HELO" | "MAIL" | "RCPT" | "RSET" | "NOOP" | "XDATABASE" => "250 2.0.0 OK\r\n".to_string(),
            _ => "500 5.5.2 Unknown command\r\n".to_string(),
        };

        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
    }
}

/// Builder for configuring a `MockUpstream`
pub struct MockUpstreamBuilder {
    config: MockConfig,
}

impl MockUpstreamBuilder {
    #[must_use]
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.config.greeting = greeting.into();
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, response: impl Into<String>) -> Self {
        self.config.data_end_response = response.into();
        self
    }

    /// Offer STARTTLS with the fixture certificate.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.config.tls = Some(tls::acceptor(&fixture_tls()).expect("fixture acceptor"));
        self
    }

    pub async fn build(self) -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(self.config);
        let received = Arc::new(RwLock::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = Arc::clone(&config);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    if let Err(err) = MockUpstream::handle_client(stream, config, log).await {
                        tracing::debug!("Mock upstream connection failed: {err}");
                    }
                });
            }
        });

        MockUpstream { addr, received }
    }
}

/// Start a tunnel in front of `upstream`. `extra` is appended to the
/// generated configuration.
pub async fn start_tunnel(upstream: SocketAddr, extra: &str) -> SocketAddr {
    let config: Config = format!(
        "[upstream]\naddress = \"{upstream}\"\nserver_name = \"localhost\"\n{extra}"
    )
    .parse()
    .expect("valid test configuration");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hooks = Hooks::from_config(&config);
    let tunnel = Listener::new(Arc::new(config), hooks);
    tokio::spawn(async move { tunnel.serve_on(listener).await });

    addr
}

/// A line-level SMTP client.
pub struct Client<S> {
    stream: BufReader<S>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    /// Perform the client side of a TLS handshake after a `220` to
    /// STARTTLS.
    pub async fn into_tls(self) -> Client<TlsStream<TcpStream>> {
        let connector = tls::connector(&fixture_tls()).expect("fixture connector");
        let name = ServerName::try_from("localhost").unwrap();
        let stream = connector
            .connect(name, self.stream.into_inner())
            .await
            .expect("TLS handshake");

        Client {
            stream: BufReader::new(stream),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub async fn send(&mut self, text: &str) {
        self.stream.get_mut().write_all(text.as_bytes()).await.unwrap();
        self.stream.get_mut().flush().await.unwrap();
    }

    /// One line including its terminator; empty once the tunnel closed.
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(READ_TIMEOUT, self.stream.read_line(&mut line))
            .await
            .expect("tunnel replied in time")
            .unwrap();
        line
    }

    /// One complete reply, line endings removed.
    pub async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            assert!(!line.is_empty(), "connection closed mid-reply");

            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.trim_end().to_string());
            if last {
                return lines;
            }
        }
    }

    /// Send a command and return the first line of the reply.
    pub async fn command(&mut self, command: &str) -> String {
        self.send(&format!("{command}\r\n")).await;
        self.reply().await.remove(0)
    }
}
