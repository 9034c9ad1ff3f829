//! In-memory model of one mail transaction.
//!
//! A [`Message`] accumulates the commands of the transaction, the collected
//! header block and as much of the body as the collector decided to buffer.
//! Rules mutate it between collection and transmission.

use std::borrow::Cow;

use mailparse::{MailAddr, MailAddrList};

pub use super::command::CommandRecord;

/// One entry of the header block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Header {
    /// A `key: value` field. Folded continuation lines are kept in `value`,
    /// separated by `\n`.
    Field { key: String, value: String },

    /// A line without a usable `key:` prefix, kept verbatim.
    Unkeyed(String),

    /// Rule trigger lifted out of the Subject. Never transmitted.
    RuleTrigger(String),
}

impl Header {
    /// Build an entry from a complete, possibly folded, header line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        match line.split_once(':') {
            Some((key, value))
                if !key.is_empty() && !key.bytes().any(|b| b.is_ascii_whitespace()) =>
            {
                Self::Field {
                    key: key.to_string(),
                    value: value.trim_start_matches([' ', '\t']).to_string(),
                }
            }
            _ => Self::Unkeyed(line.to_string()),
        }
    }

    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        matches!(self, Self::Field { key, .. } if key.eq_ignore_ascii_case(name))
    }

    /// The physical lines this entry is written as, without line endings.
    /// Rule triggers produce nothing.
    #[must_use]
    pub fn wire_lines(&self) -> Vec<String> {
        let text = match self {
            Self::Field { key, value } => format!("{key}: {value}"),
            Self::Unkeyed(line) => line.clone(),
            Self::RuleTrigger(_) => return Vec::new(),
        };

        text.split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect()
    }
}

/// Progress through the first MIME part of the body.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum MimeState {
    /// Before the opening boundary; lines are preamble.
    #[default]
    Init,
    /// Inside the headers of the first part.
    MimeHeader,
    /// Inside the body of the first part.
    Body,
    /// The first part was closed; the rest is passed through.
    Done,
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Message {
    pub commands: Vec<CommandRecord>,
    pub headers: Vec<Header>,
    /// `--` followed by the boundary parameter of the first multipart
    /// Content-Type.
    pub boundary: Option<String>,
    /// Lines before the opening boundary, each terminated by `\n`.
    pub preamble: Vec<u8>,
    /// Header lines of the first MIME part.
    pub mime_hdr: Vec<String>,
    /// Collected body, lines terminated by `\n`.
    pub body: Vec<u8>,
    /// Where body collection stopped when a boundary is known.
    pub mime_state: MimeState,
    /// The delimiter line that closed the first part, as received.
    pub closing_boundary: Option<Vec<u8>>,
    /// Whether the dot terminator was consumed during collection.
    pub terminated: bool,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything collected for the current transaction.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record(&mut self, record: CommandRecord) {
        self.commands.push(record);
    }

    /// The value of the first header called `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|header| match header {
            Header::Field { key, value } if key.eq_ignore_ascii_case(name) => Some(value.as_str()),
            _ => None,
        })
    }

    /// Replace the first header called `key`, or append one.
    pub fn set_header(&mut self, key: &str, value: &str) {
        let field = Header::Field {
            key: key.to_string(),
            value: value.to_string(),
        };

        match self.headers.iter_mut().find(|header| header.is_named(key)) {
            Some(existing) => *existing = field,
            None => self.headers.push(field),
        }
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.push(Header::Field {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove every header called `key`. Returns how many were removed.
    pub fn remove_header(&mut self, key: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|header| !header.is_named(key));
        before - self.headers.len()
    }

    /// The trigger text lifted out of the Subject, if any.
    #[must_use]
    pub fn rule_trigger(&self) -> Option<&str> {
        self.headers.iter().find_map(|header| match header {
            Header::RuleTrigger(trigger) => Some(trigger.as_str()),
            _ => None,
        })
    }

    fn addresses(&self, key: &str) -> impl Iterator<Item = String> + '_ {
        let key = key.to_string();
        self.commands
            .iter()
            .filter(move |command| command.key == key)
            .filter_map(|command| command.value.as_deref())
            .filter_map(|value| value.split_whitespace().next())
            .filter_map(parse_address)
    }

    /// Envelope sender from the recorded MAIL command. The null sender is
    /// `None`.
    #[must_use]
    pub fn sender(&self) -> Option<String> {
        self.addresses("mail").last()
    }

    /// Envelope recipients from the recorded RCPT commands.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        self.addresses("rcpt").collect()
    }

    /// The collected body decoded as UTF-8, invalid sequences replaced.
    #[must_use]
    pub fn body_text(&self) -> Cow<'_, str> {
        charset::Charset::for_encoding(encoding_rs::UTF_8)
            .decode(&self.body)
            .0
    }

    pub fn set_body(&mut self, body: &str) {
        self.body = body.as_bytes().to_vec();
    }

    /// Append text to the collected body, keeping it newline-terminated.
    pub fn append_body(&mut self, text: &str) {
        if !self.body.is_empty() && !self.body.ends_with(b"\n") {
            self.body.push(b'\n');
        }
        self.body.extend_from_slice(text.as_bytes());
        if !text.ends_with('\n') {
            self.body.push(b'\n');
        }
    }
}

fn parse_address(value: &str) -> Option<String> {
    let value = value.trim_start_matches('<').trim_end_matches('>');
    if value.is_empty() {
        return None;
    }

    let list: MailAddrList = mailparse::addrparse(value).ok()?;
    match list.first()? {
        MailAddr::Single(single) => Some(single.addr.clone()),
        MailAddr::Group(_) => None,
    }
}
