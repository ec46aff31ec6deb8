#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use tokio_tungstenite::tungstenite::http::HeaderMap;

use crate::Result;
use crate::error::Error;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum size of a single inbound message, 10 MB.
pub const DEFAULT_READ_LIMIT: usize = 10 * 1024 * 1024;

/// Configuration of the websocket connection used for subscriptions.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct WebsocketOptions {
    /// Subprotocol names offered during the handshake. The GraphQL server
    /// relies on the `Sec-WebSocket-Protocol` header to select the message
    /// specification, so these normally come from the protocol strategy.
    pub subprotocols: Vec<String>,
    /// Maximum time a single read may take before the connection is probed
    pub read_timeout: Duration,
    /// Maximum time a single write may take
    pub write_timeout: Duration,
    /// Extra HTTP headers included in the handshake request
    pub headers: HeaderMap,
}

impl Default for WebsocketOptions {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            headers: HeaderMap::new(),
        }
    }
}

impl WebsocketOptions {
    /// Merge unset fields with defaults taken from `other`.
    ///
    /// Used when user-supplied options replace the client's: absent
    /// subprotocols and zero timeouts fall back to the current values.
    #[must_use]
    pub(crate) fn merged_with(mut self, other: &Self) -> Self {
        if self.subprotocols.is_empty() {
            self.subprotocols.clone_from(&other.subprotocols);
        }
        if self.read_timeout.is_zero() {
            self.read_timeout = other.read_timeout;
        }
        if self.write_timeout.is_zero() {
            self.write_timeout = other.write_timeout;
        }
        self
    }
}

/// A retryable close-status rule: a single code or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
    pub start: i32,
    pub end: i32,
}

impl StatusRange {
    #[must_use]
    pub fn contains(&self, code: i32) -> bool {
        self.start <= code && code <= self.end
    }
}

/// Parse retry status codes from their string form.
///
/// Each entry is either a single code (`"4400"`) or an inclusive range
/// (`"4000-4500"`).
pub fn parse_status_ranges<I, S>(codes: I) -> Result<Vec<StatusRange>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ranges = Vec::new();
    for code in codes {
        let code = code.as_ref();
        let mut parts = code.splitn(2, '-');
        let parse = |part: Option<&str>| -> Result<Option<i32>> {
            match part {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<i32>()
                    .map(Some)
                    .map_err(|_| Error::validation(format!("invalid status code; input: {raw}"))),
            }
        };

        let Some(start) = parse(parts.next())? else {
            continue;
        };
        let end = parse(parts.next())?.unwrap_or(start);
        ranges.push(StatusRange { start, end });
    }

    Ok(ranges)
}
