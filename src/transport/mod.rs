//! Line-oriented byte channel for one leg of the tunnel.
//!
//! A [`Transport`] owns its connection. Upgrading to TLS consumes the
//! plaintext connection and installs the TLS one in its place; when the
//! handshake fails the plaintext stream is recovered, so the session can
//! still answer on it.

mod redact;
pub mod tls;

use core::fmt::{self, Display, Formatter};
use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use self::redact::Redactor;
pub use self::tls::TlsInfo;
use crate::{
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
    incoming, internal, outgoing,
    smtp::{
        line::strip_eol,
        reply::{is_final_line, Reply},
    },
};

/// Which side of the tunnel a transport faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The mail client that connected to the tunnel.
    Client,
    /// The upstream MTA the tunnel relays to.
    Upstream,
}

impl Display for Leg {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        })
    }
}

pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain(BufReader<Stream>),
    /// TLS where the tunnel is the server (client leg).
    TlsServer(Box<BufReader<server::TlsStream<Stream>>>),
    /// TLS where the tunnel is the client (upstream leg).
    TlsClient(Box<BufReader<client::TlsStream<Stream>>>),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    async fn read_until_eol(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Self::Plain(reader) => reader.read_until(b'\n', buf).await,
            Self::TlsServer(reader) => reader.read_until(b'\n', buf).await,
            Self::TlsClient(reader) => reader.read_until(b'\n', buf).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Self::TlsServer(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Self::TlsClient(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::TlsServer(stream) => stream.shutdown().await,
            Self::TlsClient(stream) => stream.shutdown().await,
        }
    }
}

pub struct Transport<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    connection: Option<Connection<Stream>>,
    leg: Leg,
    tls: Option<TlsInfo>,
    redactor: Redactor,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport<Stream> {
    pub fn new(stream: Stream, leg: Leg) -> Self {
        Self {
            connection: Some(Connection::Plain(BufReader::new(stream))),
            leg,
            tls: None,
            redactor: Redactor::default(),
        }
    }

    #[must_use]
    pub const fn leg(&self) -> Leg {
        self.leg
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(
            self.connection,
            Some(Connection::TlsServer(_) | Connection::TlsClient(_))
        )
    }

    #[must_use]
    pub const fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    fn connection(&mut self) -> ConnectionResult<&mut Connection<Stream>> {
        self.connection.as_mut().ok_or(ConnectionError::Closed)
    }

    /// Read one line including its terminator. `None` means the peer closed
    /// the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails.
    pub async fn read_line(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        let leg = self.leg;
        let mut line = Vec::new();

        if self.connection()?.read_until_eol(&mut line).await? == 0 {
            internal!(level = DEBUG, "{} closed the connection", leg);
            return Ok(None);
        }

        let logged = match leg {
            Leg::Client => self.redactor.command(&line),
            Leg::Upstream => self.redactor.reply(&line),
        };
        incoming!("[{}] {}", leg, logged);
        Ok(Some(line))
    }

    /// Read a complete, possibly multi-line, reply.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the peer closes before the
    /// final line.
    pub async fn read_reply(&mut self) -> ConnectionResult<Reply> {
        let mut lines = Vec::new();

        loop {
            let line = self.read_line().await?.ok_or(ConnectionError::Closed)?;
            let last = is_final_line(&line);
            lines.push(line);

            if last {
                return Ok(Reply::from_lines(lines));
            }
        }
    }

    /// Write raw bytes and flush them.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails.
    pub async fn write(&mut self, bytes: &[u8]) -> ConnectionResult<()> {
        let leg = self.leg;
        let logged = strip_eol(bytes)
            .split(|&byte| byte == b'\n')
            .map(|line| match leg {
                Leg::Client => self.redactor.reply(line),
                Leg::Upstream => self.redactor.command(line),
            })
            .collect::<Vec<_>>()
            .join(" | ");
        outgoing!("[{}] {}", leg, logged);

        Ok(self.connection()?.write_all(bytes).await?)
    }

    /// Write one line, appending CRLF.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails.
    pub async fn send<L: AsRef<[u8]> + Send>(&mut self, line: L) -> ConnectionResult<()> {
        let line = line.as_ref();
        let mut buffer = Vec::with_capacity(line.len() + 2);
        buffer.extend_from_slice(line);
        buffer.extend_from_slice(b"\r\n");

        self.write(&buffer).await
    }

    /// Relay a reply verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails.
    pub async fn send_reply(&mut self, reply: &Reply) -> ConnectionResult<()> {
        self.write(reply.to_wire().as_bytes()).await
    }

    /// Shut the connection down. Later operations fail with
    /// [`ConnectionError::Closed`].
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.shutdown().await {
                internal!(level = DEBUG, "Error closing {} connection: {}", self.leg, err);
            }
        }
    }

    /// Take the plaintext stream out for an upgrade. Anything the peer sent
    /// after the STARTTLS exchange and before the handshake is discarded.
    fn take_plain(&mut self) -> TlsResult<Stream> {
        match self.connection.take() {
            Some(Connection::Plain(reader)) => {
                if !reader.buffer().is_empty() {
                    tracing::warn!(
                        leg = %self.leg,
                        bytes = reader.buffer().len(),
                        "Discarding plaintext received before the TLS handshake"
                    );
                }
                Ok(reader.into_inner())
            }
            Some(connection) => {
                self.connection = Some(connection);
                Err(TlsError::AlreadyTls)
            }
            None => Err(TlsError::Io(io::Error::from(io::ErrorKind::NotConnected))),
        }
    }

    /// Perform the TLS server handshake on this leg.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not plaintext or the handshake fails. On a
    /// failed handshake the plaintext connection is restored.
    pub async fn upgrade_server(&mut self, acceptor: &TlsAcceptor) -> TlsResult<()> {
        let stream = self.take_plain()?;

        match acceptor.accept(stream).into_fallible().await {
            Ok(stream) => {
                self.tls = TlsInfo::of(stream.get_ref().1);
                self.connection = Some(Connection::TlsServer(Box::new(BufReader::new(stream))));
                self.log_upgrade();
                Ok(())
            }
            Err((err, stream)) => {
                self.connection = Some(Connection::Plain(BufReader::new(stream)));
                Err(TlsError::Handshake(err.to_string()))
            }
        }
    }

    /// Perform the TLS client handshake on this leg.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not plaintext or the handshake fails. On a
    /// failed handshake the plaintext connection is restored.
    pub async fn upgrade_client(
        &mut self,
        connector: &TlsConnector,
        server_name: &str,
    ) -> TlsResult<()> {
        let name = tls::server_name(server_name)?;
        let stream = self.take_plain()?;

        match connector.connect(name, stream).into_fallible().await {
            Ok(stream) => {
                self.tls = TlsInfo::of(stream.get_ref().1);
                self.connection = Some(Connection::TlsClient(Box::new(BufReader::new(stream))));
                self.log_upgrade();
                Ok(())
            }
            Err((err, stream)) => {
                self.connection = Some(Connection::Plain(BufReader::new(stream)));
                Err(TlsError::Handshake(err.to_string()))
            }
        }
    }

    fn log_upgrade(&self) {
        let (proto, cipher) = self
            .tls
            .as_ref()
            .map(|info| (info.proto(), info.cipher()))
            .unwrap_or_default();

        internal!(
            level = INFO,
            "{} connection upgraded to TLS (version: {}, cipher: {})",
            self.leg,
            proto,
            cipher
        );
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn read_lines_until_close() {
        let (near, mut far) = duplex(1024);
        let mut transport = Transport::new(near, Leg::Client);

        far.write_all(b"EHLO client\r\nQUIT\r\npartial").await.unwrap();
        drop(far);

        assert_eq!(
            transport.read_line().await.unwrap().as_deref(),
            Some(&b"EHLO client\r\n"[..])
        );
        assert_eq!(
            transport.read_line().await.unwrap().as_deref(),
            Some(&b"QUIT\r\n"[..])
        );
        assert_eq!(
            transport.read_line().await.unwrap().as_deref(),
            Some(&b"partial"[..])
        );
        assert_eq!(transport.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_multiline_reply() {
        let (near, mut far) = duplex(1024);
        let mut transport = Transport::new(near, Leg::Upstream);

        far.write_all(b"250-mx.example.com\r\n250-SIZE 100\r\n250 8BITMIME\r\n354 go\r\n")
            .await
            .unwrap();

        let reply = transport.read_reply().await.unwrap();
        assert_eq!(reply.lines().len(), 3);
        assert_eq!(reply.code(), Some(250));

        let reply = transport.read_reply().await.unwrap();
        assert_eq!(reply.to_wire(), "354 go\r\n");

        drop(far);
        assert!(matches!(
            transport.read_reply().await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn send_appends_crlf() {
        let (near, mut far) = duplex(1024);
        let mut transport = Transport::new(near, Leg::Upstream);

        transport.send("NOOP").await.unwrap();
        transport.send_reply(&Reply::from_lines(["250 OK"])).await.unwrap();
        transport.close().await;

        let mut received = String::new();
        far.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "NOOP\r\n250 OK\r\n");

        assert!(matches!(
            transport.send("NOOP").await,
            Err(ConnectionError::Closed)
        ));
        assert!(!transport.is_tls());
    }
}
