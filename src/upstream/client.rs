//! HTTP client for the upstream chat completions endpoint

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;

use crate::config::UpstreamConfig;
use crate::error::{Result, RelayError};
use crate::storage::Message;
use crate::upstream::{CompletionSource, GenerationParams, LineStream};

/// Upper bound on how much of an error response body is quoted back
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Longest line accepted from the upstream body before the stream is failed
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Wire body of a streaming chat completion request
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    messages: &'a [Message],
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    stream: bool,
}

/// `reqwest`-backed [`CompletionSource`]
///
/// # Examples
///
/// ```no_run
/// use chatrelay::config::UpstreamConfig;
/// use chatrelay::upstream::UpstreamClient;
///
/// let client = UpstreamClient::new(&UpstreamConfig::default(), "sk-test".to_string()).unwrap();
/// ```
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    api_url: String,
    model: String,
    api_key: String,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Build a client for the configured endpoint
    ///
    /// Only a connect timeout is applied; a slow body is never cut off.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Upstream` if the HTTP client cannot be built
    pub fn new(config: &UpstreamConfig, api_key: String) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = config.connect_timeout_seconds {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| RelayError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl CompletionSource for UpstreamClient {
    async fn open(&self, history: &[Message], params: &GenerationParams) -> Result<LineStream> {
        let body = CompletionRequest {
            messages: history,
            model: &self.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stream: true,
        };

        tracing::debug!(
            url = %self.api_url,
            messages = history.len(),
            max_tokens = params.max_tokens,
            "Opening upstream completion stream"
        );

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Upstream(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format_upstream_error(status, &text).into());
        }

        Ok(split_lines(response.bytes_stream()))
    }
}

fn format_upstream_error(status: reqwest::StatusCode, body: &str) -> RelayError {
    let body = body.trim();
    if body.is_empty() {
        return RelayError::Upstream(format!("HTTP {}", status));
    }
    let quoted: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    RelayError::Upstream(format!("HTTP {}: {}", status, quoted))
}

struct LineSplitter<S> {
    body: std::pin::Pin<Box<S>>,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no `\n`
    scanned: usize,
    ready: VecDeque<String>,
    /// Yielded once `ready` is empty, then the stream ends
    failure: Option<anyhow::Error>,
    finished: bool,
}

impl<S> LineSplitter<S> {
    /// Move every complete line out of the byte buffer.
    ///
    /// Only bytes appended since the last call are searched, and the buffer
    /// is compacted once per call.
    fn drain_complete_lines(&mut self) {
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if end - start > MAX_LINE_BYTES {
                return self.fail(line_too_long());
            }
            self.ready.push_back(decode_line(&self.buffer[start..end]));
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_BYTES {
            self.fail(line_too_long());
        }
    }

    fn fail(&mut self, err: RelayError) {
        self.finished = true;
        self.buffer.clear();
        self.scanned = 0;
        self.failure = Some(err.into());
    }
}

fn line_too_long() -> RelayError {
    RelayError::Upstream(format!("line exceeds {} bytes", MAX_LINE_BYTES))
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Split a response body into lines.
///
/// Bytes are buffered until a `\n` arrives, so a multi-byte character split
/// across network chunks is decoded intact. A trailing `\r` is stripped. An
/// unterminated final line is yielded when the body ends. A body read error,
/// or a line longer than [`MAX_LINE_BYTES`], becomes one `Err` item after the
/// lines already completed, and then the stream ends.
pub fn split_lines<S>(body: S) -> LineStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = LineSplitter {
        body: Box::pin(body),
        buffer: Vec::new(),
        scanned: 0,
        ready: VecDeque::new(),
        failure: None,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if let Some(err) = state.failure.take() {
                return Some((Err(err), state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_complete_lines();
                }
                Some(Err(e)) => {
                    state.fail(RelayError::Upstream(format!("stream interrupted: {}", e)));
                }
                None => {
                    state.finished = true;
                    if !state.buffer.is_empty() {
                        let rest = std::mem::take(&mut state.buffer);
                        state.ready.push_back(decode_line(&rest));
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<String> {
        let body = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from_static(c))),
        );
        split_lines(body)
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_split_lines_across_chunks() {
        let lines = collect(vec![&b"data: a"[..], &b"bc\n\ndata: "[..], &b"[DONE]\n"[..]]).await;
        assert_eq!(lines, vec!["data: abc", "", "data: [DONE]"]);
    }

    #[tokio::test]
    async fn test_split_lines_strips_carriage_return() {
        let lines = collect(vec![&b"data: x\r\n\r\n"[..]]).await;
        assert_eq!(lines, vec!["data: x", ""]);
    }

    #[tokio::test]
    async fn test_split_lines_yields_unterminated_tail() {
        let lines = collect(vec![&b"one\ntwo"[..]]).await;
        assert_eq!(lines, vec!["one", "two"]);
    }

    fn one_byte_chunks(bytes: Vec<u8>) -> LineStream {
        let chunks: Vec<reqwest::Result<Bytes>> = bytes
            .into_iter()
            .map(|b| Ok(Bytes::from(vec![b])))
            .collect();
        split_lines(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_split_lines_long_line_in_single_byte_chunks() {
        let text = "y".repeat(64 * 1024);
        let mut bytes = format!("data: {}\n", text).into_bytes();
        bytes.extend_from_slice(b"data: [DONE]\n");

        let lines: Vec<String> = one_byte_chunks(bytes)
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(lines, vec![format!("data: {}", text), "data: [DONE]".to_string()]);
    }

    #[tokio::test]
    async fn test_split_lines_rejects_oversized_line() {
        let mut body = b"data: first\n".to_vec();
        body.extend(std::iter::repeat(b'z').take(MAX_LINE_BYTES * 2));
        body.extend_from_slice(b"\ndata: never\n");
        let chunks: Vec<reqwest::Result<Bytes>> = body
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let items: Vec<Result<String>> = split_lines(futures::stream::iter(chunks)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "data: first");
        let err = items[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("line exceeds"));
    }

    #[tokio::test]
    async fn test_split_lines_rejects_oversized_line_in_one_chunk() {
        let mut body = b"ok\n".to_vec();
        body.extend(std::iter::repeat(b'z').take(MAX_LINE_BYTES + 1));
        body.extend_from_slice(b"\nafter\n");
        let chunks = vec![Ok::<_, reqwest::Error>(Bytes::from(body))];

        let items: Vec<Result<String>> = split_lines(futures::stream::iter(chunks)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "ok");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_split_lines_reassembles_multibyte_characters() {
        // "é" is 0xC3 0xA9; split it across two chunks.
        let lines = collect(vec![&b"caf\xC3"[..], &b"\xA9\n"[..]]).await;
        assert_eq!(lines, vec!["café"]);
    }

    #[test]
    fn test_format_upstream_error_with_and_without_body() {
        let err = format_upstream_error(reqwest::StatusCode::UNAUTHORIZED, "  bad key ");
        assert_eq!(err.to_string(), "Upstream error: HTTP 401 Unauthorized: bad key");

        let err = format_upstream_error(reqwest::StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.to_string(), "Upstream error: HTTP 502 Bad Gateway");
    }

    #[test]
    fn test_format_upstream_error_truncates_long_bodies() {
        let body = "x".repeat(MAX_ERROR_BODY_CHARS * 2);
        let err = format_upstream_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, &body);
        assert!(err.to_string().len() < MAX_ERROR_BODY_CHARS + 64);
    }

    #[test]
    fn test_request_body_shape() {
        let history = vec![Message::user("Hello")];
        let body = CompletionRequest {
            messages: &history,
            model: "m",
            max_tokens: 100,
            temperature: 0.1,
            top_p: 0.9,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "messages": [{"role": "user", "content": "Hello"}],
                "model": "m",
                "max_tokens": 100,
                "temperature": 0.1,
                "top_p": 0.9,
                "stream": true
            })
        );
    }

    #[test]
    fn test_debug_does_not_leak_api_key() {
        let client = UpstreamClient::new(&UpstreamConfig::default(), "sk-secret".to_string())
            .unwrap();
        assert!(!format!("{:?}", client).contains("sk-secret"));
    }
}
