//! Helpers for CRLF-terminated, dot-stuffed SMTP lines.

use std::borrow::Cow;

/// Strip a trailing `\n` or `\r\n` (or a stray `\r`).
#[must_use]
pub fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Whether `line` is the end-of-data marker, a lone `.`.
#[must_use]
pub fn is_terminator(line: &[u8]) -> bool {
    strip_eol(line) == b"."
}

/// Remove transparency dot-stuffing from a received data line (RFC 5321
/// section 4.5.2). The terminator must be checked first.
#[must_use]
pub fn unstuff(line: &[u8]) -> &[u8] {
    line.strip_prefix(b".").unwrap_or(line)
}

/// Apply transparency dot-stuffing to a data line about to be sent.
#[must_use]
pub fn stuff(line: &[u8]) -> Cow<'_, [u8]> {
    if line.first() == Some(&b'.') {
        let mut stuffed = Vec::with_capacity(line.len() + 1);
        stuffed.push(b'.');
        stuffed.extend_from_slice(line);
        Cow::Owned(stuffed)
    } else {
        Cow::Borrowed(line)
    }
}

/// Whether the line starts with whitespace, i.e. would be a header
/// continuation.
#[must_use]
pub fn starts_with_whitespace(line: &[u8]) -> bool {
    line.first().is_some_and(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eol_variants() {
        assert_eq!(strip_eol(b"250 OK\r\n"), b"250 OK");
        assert_eq!(strip_eol(b"250 OK\n"), b"250 OK");
        assert_eq!(strip_eol(b"250 OK"), b"250 OK");
        assert_eq!(strip_eol(b"\r\n"), b"");
    }

    #[test]
    fn terminator() {
        assert!(is_terminator(b".\r\n"));
        assert!(is_terminator(b".\n"));
        assert!(is_terminator(b"."));
        assert!(!is_terminator(b"..\r\n"));
        assert!(!is_terminator(b". \r\n"));
    }

    #[test]
    fn stuffing() {
        assert_eq!(unstuff(b"..Y"), b".Y");
        assert_eq!(unstuff(b".Y"), b"Y");
        assert_eq!(unstuff(b"Y."), b"Y.");

        assert_eq!(stuff(b".Y").as_ref(), b"..Y");
        assert_eq!(stuff(b"Y").as_ref(), b"Y");
        assert!(matches!(stuff(b"plain"), Cow::Borrowed(_)));
    }
}
