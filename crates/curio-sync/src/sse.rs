//! `text/event-stream` transport over reqwest.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::stream::{EventSource, MessageStream};

/// Default path of the push endpoint.
pub const DEFAULT_EVENTS_PATH: &str = "/api/events";

/// Longest line the decoder buffers before giving up on the connection.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder for the `text/event-stream` format.
///
/// Only `data` fields matter to the engine: consecutive `data:` lines are
/// joined with `\n` and emitted on the blank line that ends the message.
/// Lines end with `\n`, `\r\n`, or a lone `\r`. Comment lines (`:`) and
/// other fields are skipped. Input may be split at any byte, including
/// inside a UTF-8 sequence or between `\r` and `\n`.
#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
    after_cr: bool,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            data: Vec::new(),
            after_cr: false,
            max_line,
        }
    }

    /// Feed a chunk and return every message it completed.
    ///
    /// Fails once a single line exceeds the configured maximum; the decoder
    /// must not be fed again after that.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, SyncError> {
        let mut messages = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    let line = std::mem::take(&mut self.line);
                    if let Some(message) = self.process_line(&line) {
                        messages.push(message);
                    }
                }
                _ => {
                    if self.line.len() >= self.max_line {
                        return Err(SyncError::StreamDropped(format!(
                            "event stream line exceeds {} bytes",
                            self.max_line
                        )));
                    }
                    self.line.push(byte);
                }
            }
        }
        Ok(messages)
    }

    fn process_line(&mut self, line: &[u8]) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let message = self.data.join("\n");
            self.data.clear();
            return Some(message);
        }
        if line[0] == b':' {
            return None;
        }
        let text = String::from_utf8_lossy(line);
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text.as_ref(), ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

/// [`EventSource`] reading server-sent events from an HTTP endpoint.
pub struct SseEventSource {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl SseEventSource {
    pub fn new(
        base_url: &str,
        path: &str,
        token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::Connect(e.to_string()))?;
        Ok(Self {
            http,
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
            token,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn connect(&self) -> Result<MessageStream, SyncError> {
        let mut request = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Connect(format!("{} returned {}", self.url, status)));
        }
        info!(url = %self.url, "event stream opened");

        let bytes = Box::pin(response.bytes_stream());
        let messages = futures_util::stream::unfold(
            (bytes, SseDecoder::new(), VecDeque::new()),
            |(mut bytes, mut decoder, mut pending)| async move {
                loop {
                    if let Some(message) = pending.pop_front() {
                        return Some((Ok(message), (bytes, decoder, pending)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => match decoder.feed(&chunk) {
                            Ok(messages) => pending.extend(messages),
                            Err(e) => {
                                warn!(error = %e, "event stream line too long");
                                return Some((Err(e), (bytes, decoder, pending)));
                            }
                        },
                        Some(Err(e)) => {
                            debug!(error = %e, "event stream read failed");
                            let err = SyncError::StreamDropped(e.to_string());
                            return Some((Err(err), (bytes, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_message() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b"data: {\"type\":\"heartbeat\"}\n\n").unwrap();
        assert_eq!(messages, vec![r#"{"type":"heartbeat"}"#.to_string()]);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let messages = decoder
            .feed(b": keepalive\nevent: update\ndata: a\ndata:b\nid: 7\n\n")
            .unwrap();
        assert_eq!(messages, vec!["a\nb".to_string()]);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: one\r").unwrap().is_empty());
        assert!(decoder.feed(b"\n").unwrap().is_empty());
        assert_eq!(decoder.feed(b"\r").unwrap(), vec!["one"]);
        assert_eq!(decoder.feed(b"\ndata: two\r\n\r\n").unwrap(), vec!["two"]);
    }

    #[test]
    fn test_lone_cr_line_endings() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b"data: a\rdata: b\r\rdata: c\r").unwrap();
        assert_eq!(messages, vec!["a\nb"]);
        assert_eq!(decoder.feed(b"\r").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_oversized_line_is_an_error() {
        let mut decoder = SseDecoder::with_max_line(16);
        assert!(decoder.feed(b"data: 0123456789").unwrap().is_empty());
        let err = decoder.feed(b"abcdef").unwrap_err();
        assert!(matches!(err, SyncError::StreamDropped(_)));
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let mut decoder = SseDecoder::with_max_line(8);
        assert_eq!(decoder.feed(b"data: ab\n\n").unwrap(), vec!["ab"]);
    }

    #[test]
    fn test_utf8_split_inside_character() {
        let text = "data: caf\u{e9}\n\n".as_bytes();
        let split = text.len() - 3;
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&text[..split]).unwrap().is_empty());
        assert_eq!(decoder.feed(&text[split..]).unwrap(), vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn test_blank_lines_without_data_emit_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n: ping\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_url_join() {
        let source = SseEventSource::new(
            "http://localhost:8080/",
            DEFAULT_EVENTS_PATH,
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(source.url(), "http://localhost:8080/api/events");
    }
}
