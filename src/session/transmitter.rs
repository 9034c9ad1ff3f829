//! Writes a collected message to the upstream.
//!
//! Everything written here is dot-stuffed again; lines passed through with
//! [`raw_transfer`] are forwarded exactly as the client sent them.

use tokio::io::{AsyncRead, AsyncWrite};

use super::Deadline;
use crate::{
    config::TunnelMode,
    error::{ConnectionError, ConnectionResult, SessionError, SessionResult},
    smtp::{
        line::{is_terminator, stuff},
        Header, Message, MimeState,
    },
    transport::Transport,
};

fn push_line(wire: &mut Vec<u8>, line: &[u8]) {
    wire.extend_from_slice(&stuff(line));
    wire.extend_from_slice(b"\r\n");
}

/// Push every `\n`-separated line of `text`. A trailing newline does not
/// start another line.
fn push_text(wire: &mut Vec<u8>, text: &[u8]) {
    let text = text.strip_suffix(b"\n").unwrap_or(text);
    if text.is_empty() {
        return;
    }

    for line in text.split(|&byte| byte == b'\n') {
        push_line(wire, line.strip_suffix(b"\r").unwrap_or(line));
    }
}

/// The wire form of a header list, one `key: value` line per physical line.
#[must_use]
pub fn header_wire(headers: &[Header]) -> Vec<u8> {
    let mut wire = Vec::new();
    for line in headers.iter().flat_map(Header::wire_lines) {
        push_line(&mut wire, line.as_bytes());
    }
    wire
}

/// The wire form of the collected body: the preamble, then the first part
/// wrapped in the delimiter lines that were read, or the plain body.
#[must_use]
pub fn body_wire(message: &Message) -> Vec<u8> {
    let mut wire = Vec::new();

    if let Some(boundary) = message.boundary.as_deref() {
        push_text(&mut wire, &message.preamble);

        if message.mime_state != MimeState::Init {
            push_line(&mut wire, boundary.as_bytes());
            for line in &message.mime_hdr {
                push_line(&mut wire, line.as_bytes());
            }
            // Only a part whose header block was closed had a blank line.
            if matches!(message.mime_state, MimeState::Body | MimeState::Done) {
                wire.extend_from_slice(b"\r\n");
            }
        }
    }

    push_text(&mut wire, &message.body);

    if let Some(closing) = &message.closing_boundary {
        push_line(&mut wire, closing);
    }

    wire
}

/// Write the header lines without the separator line.
///
/// # Errors
///
/// Fails when the upstream leg fails.
pub async fn send_header<S>(upstream: &mut Transport<S>, headers: &[Header]) -> ConnectionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    let wire = header_wire(headers);
    if wire.is_empty() {
        return Ok(());
    }

    upstream.write(&wire).await
}

/// Write the headers and the blank line ending them.
///
/// # Errors
///
/// Fails when the upstream leg fails.
pub async fn transfer_header<S>(upstream: &mut Transport<S>, message: &Message) -> ConnectionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    let mut wire = header_wire(&message.headers);
    wire.extend_from_slice(b"\r\n");
    upstream.write(&wire).await
}

/// Write the collected body.
///
/// # Errors
///
/// Fails when the upstream leg fails.
pub async fn send_body<S>(upstream: &mut Transport<S>, message: &Message) -> ConnectionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    let wire = body_wire(message);
    if wire.is_empty() {
        return Ok(());
    }

    upstream.write(&wire).await
}

/// Copy client lines to the upstream unchanged until the terminator, which
/// is consumed but not copied.
///
/// # Errors
///
/// Fails when either leg fails, the client hangs up before the terminator,
/// or the deadline passes.
pub async fn raw_transfer<C, U>(
    client: &mut Transport<C>,
    upstream: &mut Transport<U>,
    deadline: &Deadline,
) -> SessionResult<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    U: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    loop {
        let line = deadline
            .run(client.read_line())
            .await?
            .map_err(SessionError::Client)?
            .ok_or(SessionError::Client(ConnectionError::Closed))?;

        if is_terminator(&line) {
            return Ok(());
        }

        upstream.write(&line).await.map_err(SessionError::Upstream)?;
    }
}

/// Write the body, pass through whatever the collector left unread, and
/// end the data section.
///
/// # Errors
///
/// Fails when either leg fails or the deadline passes.
pub async fn transfer_body<C, U>(
    upstream: &mut Transport<U>,
    client: &mut Transport<C>,
    message: &Message,
    mode: TunnelMode,
    deadline: &Deadline,
) -> SessionResult<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    U: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    send_body(upstream, message)
        .await
        .map_err(SessionError::Upstream)?;

    if !message.terminated {
        raw_transfer(client, upstream, deadline).await?;
    }

    if mode != TunnelMode::Mda {
        upstream.send(".").await.map_err(SessionError::Upstream)?;
    }

    Ok(())
}
