//! AT-response parser: a pure function from an accumulated response buffer
//! to a completed payload, a recognized error, or an "incomplete" verdict.

use crate::error::{ConnectionError, Error, MobileEquipmentError, SerialError};

/// Result of scanning a response buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A final success terminator was found. `payload` is the buffer
    /// content preceding the terminator line, with the terminator itself
    /// and its surrounding CR/LF stripped.
    Completed { payload: String },
    /// A final error terminator was found, carrying a typed error.
    Error { error: Error },
    /// No terminator is present yet; caller should read more bytes.
    Incomplete,
    /// The fragment is structurally invalid independent of any terminator
    /// (e.g. unbalanced quoting). The only error the parser synthesizes
    /// itself.
    ParseFailed,
}

const SHORT_ERRORS: &[(&str, ConnectionErrorOrSerial)] = &[
    ("NO CARRIER", ConnectionErrorOrSerial::Connection(ConnectionError::NoCarrier)),
    ("NO DIALTONE", ConnectionErrorOrSerial::Connection(ConnectionError::NoDialtone)),
    ("BUSY", ConnectionErrorOrSerial::Connection(ConnectionError::Busy)),
    ("NO ANSWER", ConnectionErrorOrSerial::Connection(ConnectionError::NoAnswer)),
    ("ERROR", ConnectionErrorOrSerial::Serial(SerialError::Unknown)),
];

#[derive(Debug, Clone, Copy)]
enum ConnectionErrorOrSerial {
    Connection(ConnectionError),
    Serial(SerialError),
}

/// Nickname table for textual extended-error codes that some dialects
/// report instead of a bare integer. Unknown nicknames fall back to the
/// nearest known integer-code family and are logged by the caller.
fn nickname_to_code(nickname: &str) -> Option<u16> {
    let table: &[(&str, u16)] = &[
        ("phone failure", 0),
        ("no connection", 1),
        ("operation not allowed", 3),
        ("operation not supported", 4),
        ("sim not inserted", 10),
        ("sim pin required", 11),
        ("sim puk required", 12),
        ("sim failure", 13),
        ("sim busy", 14),
        ("incorrect password", 16),
        ("sim pin2 required", 17),
        ("sim puk2 required", 18),
        ("memory full", 20),
        ("invalid index", 21),
        ("not found", 22),
        ("network timeout", 30),
        ("network not allowed - emergency calls only", 32),
        ("network personalization pin required", 40),
        ("unknown", 100),
    ];
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(nickname))
        .map(|(_, code)| *code)
}

/// Scans `buf` (the accumulated, echo-stripped response bytes) for a
/// terminator. `buf` is treated as text; non-UTF8 bytes cause ParseFailed.
pub fn parse(buf: &[u8]) -> Outcome {
    let text = match std::str::from_utf8(buf) {
        Ok(t) => t,
        Err(_) => return Outcome::ParseFailed,
    };

    if has_unbalanced_quotes(text) {
        return Outcome::ParseFailed;
    }

    if let Some((prefix, _rest)) = find_standalone_line(text, "OK") {
        return Outcome::Completed {
            payload: prefix.trim().to_string(),
        };
    }

    if let Some((prefix, line)) = find_standalone_prefixed_line(text, "CONNECT") {
        let _ = prefix;
        return Outcome::Completed {
            payload: line.trim().to_string(),
        };
    }

    if let Some((_, line)) = find_standalone_prefixed_line(text, "+CME ERROR:") {
        return Outcome::Error {
            error: parse_extended_error(line, "+CME ERROR:", |code| {
                Error::MobileEquipment(MobileEquipmentError::General(code))
            }),
        };
    }
    if let Some((_, line)) = find_standalone_prefixed_line(text, "+CMS ERROR:") {
        return Outcome::Error {
            error: parse_extended_error(line, "+CMS ERROR:", |code| {
                crate::error::Error::Message(crate::error::MessageError(code))
            }),
        };
    }
    if let Some((_, line)) = find_standalone_prefixed_line(text, "+EXT ERROR:") {
        return Outcome::Error {
            error: parse_extended_error(line, "+EXT ERROR:", |code| {
                Error::MobileEquipment(MobileEquipmentError::Gprs(code))
            }),
        };
    }

    for (marker, kind) in SHORT_ERRORS {
        if find_standalone_line(text, marker).is_some() {
            let error = match kind {
                ConnectionErrorOrSerial::Connection(c) => Error::Connection(*c),
                ConnectionErrorOrSerial::Serial(s) => Error::Serial(*s),
            };
            return Outcome::Error { error };
        }
    }

    Outcome::Incomplete
}

fn parse_extended_error(
    line: &str,
    marker: &str,
    make: impl Fn(u16) -> Error,
) -> Error {
    let rest = line[marker.len()..].trim();
    if let Ok(code) = rest.parse::<u16>() {
        return make(code);
    }
    match nickname_to_code(rest) {
        Some(code) => make(code),
        None => {
            tracing::warn!(nickname = %rest, "unrecognized extended error nickname, using generic code");
            make(100)
        }
    }
}

/// Finds `marker` as a standalone line (CR/LF on both sides, or buffer
/// start/end), returning (text before the line, text of the line).
fn find_standalone_line<'a>(text: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    find_standalone_prefixed_line(text, marker).filter(|(_, line)| line.trim() == marker)
}

/// Finds a line that starts with `marker`, tolerant of the standalone-line
/// framing rule (and of `\r\r\n` doubled-CR framing).
fn find_standalone_prefixed_line<'a>(text: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    for (line_start, line_end) in line_spans(text) {
        let line = &text[line_start..line_end];
        let trimmed = line.trim_matches(|c| c == '\r' || c == '\n');
        if trimmed.starts_with(marker) {
            return Some((&text[..line_start], trimmed));
        }
    }
    None
}

/// Yields (start, end) byte ranges of each line, splitting on any run of
/// `\r`/`\n`, tolerant of `\r\r\n` doubled-CR framing.
fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut line_start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'\r' || bytes[i] == b'\n' {
            if i > line_start {
                spans.push((line_start, i));
            }
            while i < bytes.len() && (bytes[i] == b'\r' || bytes[i] == b'\n') {
                i += 1;
            }
            line_start = i;
        } else {
            i += 1;
        }
    }
    if line_start < bytes.len() {
        spans.push((line_start, bytes.len()));
    }
    spans
}

fn has_unbalanced_quotes(text: &str) -> bool {
    let mut in_quote = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => escaped = true,
            '"' => in_quote = !in_quote,
            _ => {}
        }
    }
    in_quote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_with_no_terminator() {
        assert_eq!(parse(b"AT+CGMI\r"), Outcome::Incomplete);
    }

    #[test]
    fn completes_on_ok() {
        let out = parse(b"\r\nOK\r\n");
        assert_eq!(
            out,
            Outcome::Completed {
                payload: String::new()
            }
        );
    }

    #[test]
    fn busy_inside_payload_is_not_terminal() {
        // "BUSY" embedded in a longer line must not trigger.
        assert_eq!(parse(b"\r\nLINE IS BUSY NOW\r\n"), Outcome::Incomplete);
    }

    #[test]
    fn busy_as_standalone_line_is_terminal() {
        match parse(b"\r\nBUSY\r\n") {
            Outcome::Error {
                error: Error::Connection(ConnectionError::Busy),
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn extended_cme_error_numeric() {
        match parse(b"\r\n+CME ERROR: 10\r\n") {
            Outcome::Error {
                error: Error::MobileEquipment(MobileEquipmentError::General(10)),
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn extended_cme_error_nickname() {
        match parse(b"\r\n+CME ERROR: SIM not inserted\r\n") {
            Outcome::Error {
                error: Error::MobileEquipment(MobileEquipmentError::General(10)),
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unbalanced_quotes_is_parse_failed() {
        assert_eq!(parse(b"\"unterminated"), Outcome::ParseFailed);
    }

    #[test]
    fn tolerates_double_cr_framing() {
        match parse(b"AT+CGMI\r\r\nOK\r\n") {
            Outcome::Completed { .. } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
