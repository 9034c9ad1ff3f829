//! SMTP replies as relayed between the legs.
//!
//! A reply is kept as its physical lines so it can be relayed without
//! reformatting. Capability edits (removing `STARTTLS`, cutting `AUTH`,
//! splicing extensions) operate on whole lines and then renormalise the
//! `NNN-`/`NNN ` separators so the last line always closes the reply.

use core::fmt::{self, Display, Formatter};

use super::{line::strip_eol, Status};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
}

/// Whether a physical reply line ends a (possibly multi-line) reply.
#[must_use]
pub fn is_final_line(line: &[u8]) -> bool {
    line.get(3) != Some(&b'-')
}

impl Reply {
    #[must_use]
    pub fn new(status: Status, text: &str) -> Self {
        Self {
            lines: vec![format!("{status} {text}")],
        }
    }

    /// Build a reply from raw physical lines, line endings optional.
    #[must_use]
    pub fn from_lines<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        Self {
            lines: lines
                .into_iter()
                .map(|line| String::from_utf8_lossy(strip_eol(line.as_ref())).into_owned())
                .collect(),
        }
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The three digit code of the first line, if it has one.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        let first = self.lines.first()?;
        first.get(..3)?.parse().ok()
    }

    /// Positive completion or intermediate: the leading digit is below `4`.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.lines
            .first()
            .and_then(|line| line.bytes().next())
            .is_some_and(|digit| digit.is_ascii_digit() && digit < b'4')
    }

    /// The text of each line after its `NNN-`/`NNN ` prefix.
    fn text(line: &str) -> &str {
        line.get(4..).unwrap_or_default()
    }

    fn keyword(line: &str) -> &str {
        Self::text(line).split_whitespace().next().unwrap_or_default()
    }

    /// Whether any line advertises `capability` as its first word.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.lines
            .iter()
            .any(|line| Self::keyword(line).eq_ignore_ascii_case(capability))
    }

    /// Remove every line advertising `capability`. Returns whether anything
    /// was removed.
    pub fn remove_capability(&mut self, capability: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|line| !Self::keyword(line).eq_ignore_ascii_case(capability));

        let removed = self.lines.len() != before;
        if removed {
            self.normalize();
        }
        removed
    }

    /// Cut out the first `250` line whose text starts with `AUTH `. Returns
    /// its position and the mechanism list that followed.
    pub fn take_auth(&mut self) -> Option<(usize, String)> {
        let index = self.lines.iter().position(|line| {
            line.starts_with("250")
                && matches!(line.as_bytes().get(3), Some(b'-' | b' '))
                && Self::text(line).starts_with("AUTH ")
        })?;

        let line = self.lines.remove(index);
        self.normalize();
        Some((index, Self::text(&line)["AUTH ".len()..].to_string()))
    }

    /// Insert capability lines before `index`, taking the code from the
    /// reply's first line.
    pub fn insert_capabilities<I, S>(&mut self, index: usize, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let code = self.code().unwrap_or(250);
        let index = index.min(self.lines.len());
        let lines: Vec<String> = capabilities
            .into_iter()
            .map(|capability| format!("{code}-{}", capability.as_ref()))
            .collect();

        if lines.is_empty() {
            return;
        }

        self.lines.splice(index..index, lines);
        self.normalize();
    }

    /// Insert capability lines just before the final line.
    pub fn append_capabilities<I, S>(&mut self, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index = self.lines.len().saturating_sub(1).max(1);
        self.insert_capabilities(index, capabilities);
    }

    /// Make every line but the last a continuation line.
    pub fn normalize(&mut self) {
        let last = self.lines.len().saturating_sub(1);
        for (index, line) in self.lines.iter_mut().enumerate() {
            let separator = if index == last { " " } else { "-" };
            if !line
                .get(..3)
                .is_some_and(|code| code.bytes().all(|b| b.is_ascii_digit()))
            {
                continue;
            }

            match line.as_bytes().get(3).copied() {
                Some(b'-' | b' ') => line.replace_range(3..4, separator),
                None if separator == "-" => line.push('-'),
                _ => {}
            }
        }
    }

    /// Wire form: every line followed by CRLF.
    #[must_use]
    pub fn to_wire(&self) -> String {
        self.lines.iter().fold(String::new(), |mut wire, line| {
            wire.push_str(line);
            wire.push_str("\r\n");
            wire
        })
    }

    /// Rewrite a single-line `220 host rest` greeting to name the tunnel.
    /// Greetings that already name it, or that are not a plain `220`, are
    /// left untouched.
    pub fn rewrite_banner(&mut self, version: &str) {
        let [line] = self.lines.as_mut_slice() else {
            return;
        };

        if !line.starts_with("220 ") || line.contains(version) {
            return;
        }

        let rest = &line[4..];
        let rewritten = match rest.split_once(' ') {
            Some((host, tail)) => format!("220 {host} ({version}) {tail}"),
            None => format!("220 {rest} ({version})"),
        };
        *line = rewritten;
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.lines.join(" / "))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn reply(wire: &str) -> Reply {
        Reply::from_lines(wire.split_inclusive('\n'))
    }

    #[test]
    fn final_lines() {
        assert!(is_final_line(b"250 OK\r\n"));
        assert!(!is_final_line(b"250-PIPELINING\r\n"));
        assert!(is_final_line(b"250\r\n"));
    }

    #[test]
    fn codes() {
        let ok = reply("250-mx.example.com\r\n250 SIZE 100\r\n");
        assert_eq!(ok.code(), Some(250));
        assert!(ok.is_positive());

        assert!(reply("354 go ahead\r\n").is_positive());
        assert!(!reply("454 TLS not available\r\n").is_positive());
        assert!(!reply("garbage\r\n").is_positive());
        assert!(!Reply::default().is_positive());
        assert_eq!(Reply::default().code(), None);
    }

    #[test]
    fn remove_starttls_from_last_line() {
        let mut ehlo = reply("250-STARTTLS\r\n250 AUTH PLAIN\r\n");
        assert!(ehlo.has_capability("starttls"));
        assert!(ehlo.remove_capability("STARTTLS"));
        assert_eq!(ehlo.to_wire(), "250 AUTH PLAIN\r\n");

        let mut ehlo = reply("250-mx.example.com\r\n250-SIZE 100\r\n250 STARTTLS\r\n");
        assert!(ehlo.remove_capability("STARTTLS"));
        assert_eq!(ehlo.to_wire(), "250-mx.example.com\r\n250 SIZE 100\r\n");
        assert!(!ehlo.remove_capability("STARTTLS"));
    }

    #[test]
    fn take_auth() {
        let mut ehlo = reply("250-mx.example.com\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n");
        assert_eq!(ehlo.take_auth(), Some((1, "PLAIN LOGIN".to_string())));
        assert_eq!(ehlo.to_wire(), "250-mx.example.com\r\n250 8BITMIME\r\n");

        let mut ehlo = reply("250-mx.example.com\r\n250 AUTH=PLAIN\r\n");
        assert_eq!(ehlo.take_auth(), None);

        let mut rejected = reply("550 AUTH PLAIN\r\n");
        assert_eq!(rejected.take_auth(), None);
    }

    #[test]
    fn splice_capabilities() {
        let mut ehlo = reply("250-mx.example.com\r\n250 SIZE 100\r\n");
        ehlo.append_capabilities(["XDATABASE"]);
        assert_eq!(
            ehlo.to_wire(),
            "250-mx.example.com\r\n250-XDATABASE\r\n250 SIZE 100\r\n"
        );

        let mut single = reply("250 mx.example.com\r\n");
        single.append_capabilities(["AUTH PLAIN LOGIN"]);
        assert_eq!(
            single.to_wire(),
            "250-mx.example.com\r\n250 AUTH PLAIN LOGIN\r\n"
        );

        let mut at_end = reply("250-mx.example.com\r\n250 SIZE 100\r\n");
        at_end.insert_capabilities(2, ["AUTH LOGIN"]);
        assert_eq!(
            at_end.to_wire(),
            "250-mx.example.com\r\n250-SIZE 100\r\n250 AUTH LOGIN\r\n"
        );

        let mut unchanged = reply("250 mx.example.com\r\n");
        unchanged.append_capabilities(Vec::<String>::new());
        assert_eq!(unchanged.to_wire(), "250 mx.example.com\r\n");
    }

    #[test]
    fn banner() {
        let mut banner = reply("220 mx.example.com ESMTP Postfix\r\n");
        banner.rewrite_banner("smtp-tunnel 0.1.0");
        assert_eq!(
            banner.to_wire(),
            "220 mx.example.com (smtp-tunnel 0.1.0) ESMTP Postfix\r\n"
        );

        banner.rewrite_banner("smtp-tunnel 0.1.0");
        assert_eq!(
            banner.to_wire(),
            "220 mx.example.com (smtp-tunnel 0.1.0) ESMTP Postfix\r\n"
        );

        let mut bare = reply("220 mx.example.com\r\n");
        bare.rewrite_banner("smtp-tunnel 0.1.0");
        assert_eq!(bare.to_wire(), "220 mx.example.com (smtp-tunnel 0.1.0)\r\n");

        let mut multi = reply("220-mx.example.com\r\n220 ready\r\n");
        multi.rewrite_banner("smtp-tunnel 0.1.0");
        assert_eq!(multi.to_wire(), "220-mx.example.com\r\n220 ready\r\n");

        let mut busy = reply("421 busy\r\n");
        busy.rewrite_banner("smtp-tunnel 0.1.0");
        assert_eq!(busy.to_wire(), "421 busy\r\n");
    }
}
