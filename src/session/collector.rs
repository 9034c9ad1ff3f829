//! Reads a message from the client after a positive DATA reply.
//!
//! Header lines are unfolded into [`Header`]s. The body is collected whole,
//! or, when the headers named a MIME boundary, only up to the closing
//! delimiter of the first part; the rest is left on the wire for the
//! transmitter to pass through untouched.

use tokio::io::{AsyncRead, AsyncWrite};

use super::Deadline;
use crate::{
    error::{SessionError, SessionResult},
    smtp::{
        line::{is_terminator, starts_with_whitespace, strip_eol, unstuff},
        Header, Message, MimeState,
    },
    transport::Transport,
};

const CONTENT_TYPE: &str = "content-type:";

/// How a collection step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The step is complete and more message data follows.
    Continue,
    /// The lone `.` was read; the message is complete.
    Terminated,
    /// The client closed the connection mid-message.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectOptions<'a> {
    /// Ignore MIME structure and collect the entire body.
    pub entire_body: bool,
    /// Marker splitting a rule trigger off the Subject.
    pub trigger: &'a str,
}

async fn next_line<S>(client: &mut Transport<S>, deadline: &Deadline) -> SessionResult<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    deadline
        .run(client.read_line())
        .await?
        .map_err(SessionError::Client)
}

/// Read header lines up to the blank separator line.
///
/// # Errors
///
/// Fails when the client leg fails or the deadline passes.
pub async fn collect_headers<S>(
    client: &mut Transport<S>,
    message: &mut Message,
    options: &CollectOptions<'_>,
    deadline: &Deadline,
) -> SessionResult<Progress>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    let mut pending: Option<String> = None;

    let progress = loop {
        let Some(raw) = next_line(client, deadline).await? else {
            break Progress::Closed;
        };

        if is_terminator(&raw) {
            message.terminated = true;
            break Progress::Terminated;
        }

        let line = unstuff(strip_eol(&raw));

        if starts_with_whitespace(line) {
            if let Some(header) = pending.as_mut() {
                header.push('\n');
                header.push_str(&String::from_utf8_lossy(line));
                continue;
            }

            // A message that opens with a continuation line has no headers.
            message.body.extend_from_slice(line);
            message.body.push(b'\n');
            break Progress::Continue;
        }

        if let Some(header) = pending.take() {
            add_header(message, &header, options);
        }

        if line.is_empty() {
            break Progress::Continue;
        }

        pending = Some(String::from_utf8_lossy(line).into_owned());
    };

    if let Some(header) = pending {
        add_header(message, &header, options);
    }

    Ok(progress)
}

fn add_header(message: &mut Message, text: &str, options: &CollectOptions<'_>) {
    if !options.entire_body && message.boundary.is_none() {
        message.boundary = boundary_of(text);
    }

    match Header::parse(text) {
        Header::Field { key, value } if key.eq_ignore_ascii_case("subject") => {
            match split_trigger(&value, options.trigger) {
                Some((subject, trigger)) => {
                    message.headers.push(Header::Field {
                        key,
                        value: subject.to_string(),
                    });
                    message.headers.push(Header::RuleTrigger(trigger.to_string()));
                }
                None => message.headers.push(Header::Field { key, value }),
            }
        }
        header => message.headers.push(header),
    }
}

fn split_trigger<'a>(subject: &'a str, trigger: &str) -> Option<(&'a str, &'a str)> {
    if trigger.is_empty() {
        return None;
    }

    let (subject, rest) = subject.split_once(trigger)?;
    Some((subject.trim_end(), rest.trim()))
}

/// The delimiter line announced by a `Content-Type` header, as `--value`.
fn boundary_of(header: &str) -> Option<String> {
    let prefix = header.get(..CONTENT_TYPE.len())?;
    if !prefix.eq_ignore_ascii_case(CONTENT_TYPE) {
        return None;
    }

    let content_type = mailparse::parse_content_type(&header[CONTENT_TYPE.len()..]);
    content_type
        .params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| format!("--{value}"))
}

/// Read body lines. Without a boundary this runs to the terminator; with
/// one it stops after the first part's closing delimiter.
///
/// # Errors
///
/// Fails when the client leg fails or the deadline passes.
pub async fn collect_body<S>(
    client: &mut Transport<S>,
    message: &mut Message,
    deadline: &Deadline,
) -> SessionResult<Progress>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    loop {
        if message.mime_state == MimeState::Done {
            return Ok(Progress::Continue);
        }

        let Some(raw) = next_line(client, deadline).await? else {
            return Ok(Progress::Closed);
        };

        if is_terminator(&raw) {
            message.terminated = true;
            return Ok(Progress::Terminated);
        }

        let line = unstuff(strip_eol(&raw));

        let Some(boundary) = message.boundary.as_deref() else {
            push_line(&mut message.body, line);
            continue;
        };

        match message.mime_state {
            MimeState::Init => {
                if line.trim_ascii_end() == boundary.as_bytes() {
                    message.mime_state = MimeState::MimeHeader;
                } else {
                    push_line(&mut message.preamble, line);
                }
            }
            MimeState::MimeHeader => {
                if line.is_empty() {
                    message.mime_state = MimeState::Body;
                } else {
                    message.mime_hdr.push(String::from_utf8_lossy(line).into_owned());
                }
            }
            MimeState::Body => {
                if line.starts_with(boundary.as_bytes()) {
                    message.closing_boundary = Some(line.to_vec());
                    message.mime_state = MimeState::Done;
                } else {
                    push_line(&mut message.body, line);
                }
            }
            MimeState::Done => {}
        }
    }
}

fn push_line(buffer: &mut Vec<u8>, line: &[u8]) {
    buffer.extend_from_slice(line);
    buffer.push(b'\n');
}
