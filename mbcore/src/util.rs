//! Small standalone helpers: AT string quoting, hex<->bytes conversion, and
//! ISO-8601 rendering, kept together as one small single-purpose module.

use chrono::{DateTime, TimeZone, Utc};

/// Encloses `input` in ASCII double quotes, escaping internal `"` and `\`
/// as `\"` and `\\`. A `None` input becomes the literal `""`.
pub fn quote(input: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.map_or(2, |b| b.len() + 2));
    out.push(b'"');
    if let Some(bytes) = input {
        for &b in bytes {
            if b == b'"' || b == b'\\' {
                out.push(b'\\');
            }
            out.push(b);
        }
    }
    out.push(b'"');
    out
}

/// Inverse of [`quote`]. Returns an error if `input` is not a well-formed
/// quoted string (must start and end with an unescaped `"`).
pub fn unquote(input: &[u8]) -> Result<Vec<u8>, &'static str> {
    if input.len() < 2 || input[0] != b'"' || input[input.len() - 1] != b'"' {
        return Err("input is not a quoted string");
    }
    let body = &input[1..input.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] == b'\\' && i + 1 < body.len() {
            out.push(body[i + 1]);
            i += 2;
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Converts bytes to a lowercase hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Converts an even-length hex string into bytes. Rejects odd length and
/// non-hex characters.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, &'static str> {
    if hex.len() % 2 != 0 {
        return Err("hex string has odd length");
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = hex_digit(chunk[0]).ok_or("invalid hex digit")?;
        let lo = hex_digit(chunk[1]).ok_or("invalid hex digit")?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Renders a UTC timestamp in ISO-8601 with second precision, e.g.
/// `2026-07-26T12:00:00Z`.
pub fn to_iso8601(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Permissive ISO-8601 parser accepting the format produced by
/// [`to_iso8601`], used by the round-trip test below.
pub fn from_iso8601(s: &str) -> Result<DateTime<Utc>, &'static str> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .map_err(|_| "invalid ISO-8601 timestamp")?;
    Ok(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_unquote_round_trip() {
        let input = b"hello \"world\" \\ end";
        let quoted = quote(Some(input));
        assert_eq!(unquote(&quoted).unwrap(), input);
    }

    #[test]
    fn quote_none_is_empty_quotes() {
        assert_eq!(quote(None), b"\"\"");
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0x1f, 0xff, 0xa5];
        let hex = bytes_to_hex(&bytes);
        assert_eq!(hex_to_bytes(&hex).unwrap(), bytes);
    }

    #[test]
    fn hex_rejects_odd_length() {
        assert!(hex_to_bytes("abc").is_err());
    }

    #[test]
    fn hex_rejects_non_hex() {
        assert!(hex_to_bytes("zz").is_err());
    }

    #[test]
    fn iso8601_round_trip() {
        let dt = Utc.with_ymd_and_hms(2026, 7, 26, 12, 30, 45).unwrap();
        let s = to_iso8601(&dt);
        assert_eq!(from_iso8601(&s).unwrap(), dt);
    }
}
