use core::fmt::{self, Display, Formatter};

use super::line::strip_eol;

/// The verbs the tunnel treats specially. Everything else is relayed as
/// [`Verb::Other`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Verb {
    Ehlo,
    Helo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Quit,
    StartTls,
    XDatabase,
    Auth,
    Other,
}

impl Verb {
    fn from_word(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "ehlo" => Self::Ehlo,
            "helo" => Self::Helo,
            "mail" => Self::Mail,
            "rcpt" => Self::Rcpt,
            "data" => Self::Data,
            "rset" => Self::Rset,
            "quit" => Self::Quit,
            "starttls" => Self::StartTls,
            "xdatabase" => Self::XDatabase,
            "auth" => Self::Auth,
            _ => Self::Other,
        }
    }

    /// The `from:`/`to:` infix that follows the verb, if it takes one.
    const fn infix(self) -> Option<&'static str> {
        match self {
            Self::Mail => Some("from:"),
            Self::Rcpt => Some("to:"),
            _ => None,
        }
    }
}

/// One command as recorded for rule matching: the lowercased verb and the
/// argument that followed it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommandRecord {
    pub key: String,
    pub value: Option<String>,
}

/// A command line received from the client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ClientCommand {
    raw: Vec<u8>,
    text: String,
    verb: Verb,
}

impl ClientCommand {
    /// Classify a raw line. The line ending is not part of the command.
    #[must_use]
    pub fn parse(line: &[u8]) -> Self {
        let raw = strip_eol(line).to_vec();
        let text = String::from_utf8_lossy(&raw).into_owned();
        let verb = text
            .split_whitespace()
            .next()
            .map_or(Verb::Other, Verb::from_word);

        Self { raw, text, verb }
    }

    #[must_use]
    pub const fn verb(&self) -> Verb {
        self.verb
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Everything after the verb, without surrounding whitespace.
    #[must_use]
    pub fn argument(&self) -> &str {
        let text = self.text.trim_start();
        text.find(char::is_whitespace)
            .map_or("", |end| text[end..].trim())
    }

    /// Split `from:`/`to:` off a MAIL or RCPT argument. Yields the infix as
    /// typed and the remainder without leading whitespace.
    fn split_infix(&self) -> Option<(&str, &str)> {
        let infix = self.verb.infix()?;
        let argument = self.argument();
        let head = argument.get(..infix.len())?;

        head.eq_ignore_ascii_case(infix)
            .then(|| (head, argument[infix.len()..].trim_start()))
    }

    /// The record kept in the message for rule matching.
    #[must_use]
    pub fn record(&self) -> CommandRecord {
        let key = self
            .text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        let value = self
            .split_infix()
            .map_or_else(|| self.argument(), |(_, rest)| rest);

        CommandRecord {
            key,
            value: (!value.is_empty()).then(|| value.to_string()),
        }
    }

    /// The bytes to forward upstream, without line ending. MAIL FROM and
    /// RCPT TO have the whitespace around the verb and infix collapsed;
    /// every other command is forwarded as received.
    #[must_use]
    pub fn forward_line(&self) -> Vec<u8> {
        match self.split_infix() {
            Some((infix, rest)) => {
                let verb = self.text.split_whitespace().next().unwrap_or_default();
                format!("{verb} {infix}{rest}").into_bytes()
            }
            None => self.raw.clone(),
        }
    }
}

impl Display for ClientCommand {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.text)
    }
}
