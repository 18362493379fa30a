//! AT Port Specialization: layers AT-specific quoting and a convenience
//! `command_full` API over a plain [`SerialPort`].

use std::time::Duration;

use crate::error::Result;
use crate::serial::{CancelToken, PortKind, SerialPort};
use crate::util::{quote, unquote};

/// A [`SerialPort`] specialized for the text-AT protocol: owns the default
/// response parser behavior (delegated to [`crate::at_parser`] inside
/// `SerialPort::send`), exposes the quoting helper, and offers
/// `command_full` for callers that just want a parsed result.
#[derive(Clone)]
pub struct AtPort {
    port: SerialPort,
    send_lf: bool,
}

impl AtPort {
    pub fn new(device: impl Into<String>) -> Self {
        AtPort {
            port: SerialPort::new(device, PortKind::Tty),
            send_lf: false,
        }
    }

    pub fn from_serial_port(port: SerialPort) -> Self {
        AtPort { port, send_lf: false }
    }

    pub fn serial_port(&self) -> &SerialPort {
        &self.port
    }

    /// When enabled, commands are terminated with `\r\n` instead of bare
    /// `\r`.
    pub fn set_send_lf(&mut self, enabled: bool) {
        self.send_lf = enabled;
    }

    /// Runs the full send/await/parse state machine for one AT command
    /// and returns its payload.
    pub async fn command_full(
        &self,
        command: &str,
        timeout: Duration,
        cached: bool,
        cancel: CancelToken,
    ) -> Result<String> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.push(b'\r');
        if self.send_lf {
            bytes.push(b'\n');
        }
        self.port.send(bytes, timeout, false, cached, cancel).await
    }

    /// Quotes a string argument for embedding in an AT command.
    pub fn quote_arg(value: Option<&str>) -> String {
        String::from_utf8_lossy(&quote(value.map(str::as_bytes))).to_string()
    }

    /// Inverse of [`AtPort::quote_arg`].
    pub fn unquote_arg(value: &str) -> Result<String> {
        let bytes = unquote(value.as_bytes()).map_err(|_| {
            crate::error::Error::Serial(crate::error::SerialError::ParseFailed)
        })?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_round_trips_plain_string() {
        let quoted = AtPort::quote_arg(Some("hello"));
        assert_eq!(quoted, "\"hello\"");
        assert_eq!(AtPort::unquote_arg(&quoted).unwrap(), "hello");
    }

    #[test]
    fn quote_none_is_empty_quotes() {
        assert_eq!(AtPort::quote_arg(None), "\"\"");
    }

    #[test]
    fn quote_escapes_special_chars() {
        let quoted = AtPort::quote_arg(Some("a\"b\\c"));
        assert_eq!(quoted, "\"a\\\"b\\\\c\"");
        assert_eq!(AtPort::unquote_arg(&quoted).unwrap(), "a\"b\\c");
    }
}
