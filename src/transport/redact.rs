//! Keeps SASL credentials out of the wire log.
//!
//! An `AUTH` command opens an exchange; every command-side line after it is
//! a credential until a reply other than `334` closes the exchange.

use std::borrow::Cow;

use crate::smtp::line::strip_eol;

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Default)]
pub(super) struct Redactor {
    sasl: bool,
}

impl Redactor {
    /// A line sent by the side issuing commands.
    pub(super) fn command<'a>(&mut self, line: &'a [u8]) -> Cow<'a, str> {
        let text = String::from_utf8_lossy(strip_eol(line));

        let mut words = text.split_ascii_whitespace();
        if words
            .next()
            .is_some_and(|verb| verb.eq_ignore_ascii_case("AUTH"))
        {
            self.sasl = true;
            let mechanism = words.next().map(str::to_string);
            let initial = words.next().is_some();
            return match mechanism {
                Some(mechanism) if initial => Cow::Owned(format!("AUTH {mechanism} {REDACTED}")),
                _ => text,
            };
        }

        if self.sasl {
            Cow::Borrowed(REDACTED)
        } else {
            text
        }
    }

    /// A line sent by the side answering commands.
    pub(super) fn reply<'a>(&mut self, line: &'a [u8]) -> Cow<'a, str> {
        if !line.starts_with(b"334") {
            self.sasl = false;
        }
        String::from_utf8_lossy(strip_eol(line))
    }
}
