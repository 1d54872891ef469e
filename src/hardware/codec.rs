//! Command Codec
//!
//! Reply classification for the controller's command dialect.
//!
//! - `:` as the first reply byte acknowledges a command
//! - `?` rejects it; the controller's explanation is fetched with `TC1`
//! - anything else is a protocol anomaly, reported with the raw byte
//!
//! Numeric queries (`TPA`, `MG homeTime`, ...) are parsed the way the controller prints
//! them: leading whitespace, optional sign, digits. A reply that does not start with a
//! number reads as zero; sanity checks belong to the caller.

use crate::config::ControllerConfig;
use crate::error::{GuiderError, GuiderResult};
use crate::hardware::link::Link;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Query that reports the text of the controller's most recent error.
pub const ERROR_TEXT_QUERY: &str = "TC1";

/// Reply to a pass-through command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughReply {
    /// Raw reply text
    pub reply: String,
    /// `TC1` explanation when the reply ended in `?`
    pub error_text: Option<String>,
}

/// Typed request/response helpers over a [`Link`].
#[derive(Clone)]
pub struct Codec {
    link: Arc<dyn Link>,
    query_buffer: usize,
    command_buffer: usize,
}

impl Codec {
    /// Create a codec with explicit receive buffer sizes.
    pub fn new(link: Arc<dyn Link>, query_buffer: usize, command_buffer: usize) -> Self {
        Self {
            link,
            query_buffer,
            command_buffer,
        }
    }

    /// Create a codec using the configured buffer sizes.
    pub fn from_config(link: Arc<dyn Link>, config: &ControllerConfig) -> Self {
        Self::new(link, config.query_buffer, config.command_buffer)
    }

    /// Send a command and return the reply text from a zero-filled buffer.
    pub async fn ask(&self, command: &str) -> GuiderResult<String> {
        self.ask_with_capacity(command, self.query_buffer).await
    }

    async fn ask_with_capacity(&self, command: &str, capacity: usize) -> GuiderResult<String> {
        let reply = self.link.send(command, capacity).await?;
        Ok(reply_text(&reply))
    }

    /// Send a query and parse the leading integer of the reply.
    ///
    /// A value that does not fit an `i32` degrades to zero like any other unparsable reply.
    pub async fn ask_int(&self, command: &str) -> GuiderResult<i32> {
        let reply = self.ask(command).await?;
        Ok(i32::try_from(parse_leading_int(&reply)).unwrap_or(0))
    }

    /// Send a query and parse the leading long integer of the reply.
    pub async fn ask_long(&self, command: &str) -> GuiderResult<i64> {
        let reply = self.ask(command).await?;
        Ok(parse_leading_int(&reply))
    }

    /// Send a command that expects an acknowledgement.
    ///
    /// # Errors
    /// - [`GuiderError::Controller`] with the `TC1` text if the controller answered `?`
    /// - [`GuiderError::Protocol`] with the raw first byte for any other reply
    #[instrument(level = "trace", skip(self), err)]
    pub async fn tell(&self, command: &str) -> GuiderResult<()> {
        let reply = self.link.send(command, self.command_buffer).await?;
        match reply.first().copied() {
            Some(b':') => Ok(()),
            Some(b'?') => {
                let text = self.ask_with_capacity(ERROR_TEXT_QUERY, self.command_buffer).await?;
                let text = error_text(&text);
                debug!(command, error = %text, "controller rejected command");
                Err(GuiderError::Controller(text))
            }
            Some(byte) => Err(GuiderError::Protocol { byte }),
            None => Err(GuiderError::Protocol { byte: 0 }),
        }
    }

    /// Send arbitrary command text with the large buffer.
    ///
    /// Intended for operator pass-through; the reply is returned verbatim and the `TC1`
    /// explanation is attached when the controller signalled an error.
    pub async fn passthrough(&self, command: &str) -> GuiderResult<PassthroughReply> {
        let reply = self.ask_with_capacity(command, self.command_buffer).await?;
        let error_text = if reply.trim_end().ends_with('?') {
            let text = self.ask_with_capacity(ERROR_TEXT_QUERY, self.command_buffer).await?;
            Some(error_text(&text))
        } else {
            None
        };
        Ok(PassthroughReply { reply, error_text })
    }
}

/// Text of a reply buffer up to the first NUL byte.
fn reply_text(reply: &[u8]) -> String {
    let end = reply.iter().position(|&b| b == 0).unwrap_or(reply.len());
    String::from_utf8_lossy(&reply[..end]).into_owned()
}

/// `TC1` reply without surrounding whitespace and the trailing `:` prompt.
fn error_text(reply: &str) -> String {
    let trimmed = reply.trim();
    trimmed.strip_suffix(':').unwrap_or(trimmed).trim_end().to_string()
}

/// Parse a leading integer the way `atol` does; anything unparsable is zero.
pub fn parse_leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    if negative {
        -value
    } else {
        value
    }
}
