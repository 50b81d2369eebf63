//! OpenAI-compatible streaming chat completions.
//!
//! Azure endpoints (`*.azure.com`) authenticate with an `api-key` header and
//! need an `api-version` query parameter; everything else gets a Bearer token.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;

use super::{ChatTurn, CompletionProvider, FragmentStream, UpstreamError};
use crate::config::UpstreamConfig;

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    is_azure: bool,
}

impl OpenAiCompatProvider {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let is_azure = config.endpoint.contains(".azure.com");
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: completions_url(&config.endpoint, is_azure, &config.api_version),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            is_azure,
        })
    }
}

fn completions_url(endpoint: &str, is_azure: bool, api_version: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if is_azure && !base.contains('?') {
        format!("{base}/chat/completions?api-version={api_version}")
    } else {
        format!("{base}/chat/completions")
    }
}

/// 408, 429 and 5xx are worth retrying; every other status is final.
fn classify_status(status: u16, body: &str) -> UpstreamError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("API error {status}: {snippet}");
    if status == 408 || status == 429 || status >= 500 {
        UpstreamError::Transient(message)
    } else {
        UpstreamError::Fatal(message)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn stream_completion(&self, turns: Vec<ChatTurn>) -> Result<FragmentStream, UpstreamError> {
        let body = json!({
            "model": self.model,
            "messages": turns,
            "stream": true,
        });

        tracing::debug!(url = %self.url, model = %self.model, turns = turns.len(), "opening upstream stream");

        let mut request = self.client.post(&self.url).json(&body);
        request = if self.is_azure {
            request.header("api-key", &self.api_key)
        } else {
            request.bearer_auth(&self.api_key)
        };

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), &text);
            tracing::warn!(status = status.as_u16(), error = %err, "upstream rejected request");
            return Err(err);
        }

        Ok(decode_stream(response.bytes_stream()))
    }

    fn name(&self) -> &str {
        if self.is_azure {
            "azure-openai"
        } else {
            "openai"
        }
    }
}

/// Incremental decoder for the `data:` lines of a chat-completions SSE body.
///
/// Bytes are buffered until a full line is available, so UTF-8 sequences split
/// across network chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
    saw_finish_reason: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once `[DONE]` has been read; later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one network chunk, returning the content fragments it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, UpstreamError> {
        if self.done {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        let mut fragments = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.decode_line(&line, &mut fragments)?;
            if self.done {
                self.buf.clear();
                break;
            }
        }
        Ok(fragments)
    }

    /// Handle end of input: decode any unterminated last line, then decide
    /// whether the stream ended cleanly.
    pub fn finish(&mut self) -> Result<Vec<String>, UpstreamError> {
        let mut fragments = Vec::new();
        if !self.done && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.decode_line(&line, &mut fragments)?;
        }
        if self.done || self.saw_finish_reason {
            self.done = true;
            Ok(fragments)
        } else {
            Err(UpstreamError::Transient(
                "upstream closed the stream before completion".into(),
            ))
        }
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<String>) -> Result<(), UpstreamError> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| UpstreamError::Fatal(format!("invalid UTF-8 in stream: {e}")))?
            .trim();

        let Some(data) = line.strip_prefix("data:") else {
            // comments, `event:` and `id:` lines carry no content
            return Ok(());
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let value: Value = serde_json::from_str(data)
            .map_err(|e| UpstreamError::Fatal(format!("undecodable stream payload: {e}")))?;

        if let Some(error) = value.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error");
            return Err(UpstreamError::Transient(format!("upstream error event: {message}")));
        }

        // Azure sends a leading chunk with an empty `choices` array
        let Some(choice) = value["choices"].get(0) else {
            return Ok(());
        };
        if choice["finish_reason"].is_string() {
            self.saw_finish_reason = true;
        }
        if let Some(text) = choice["delta"]["content"].as_str() {
            if !text.is_empty() {
                out.push(text.to_string());
            }
        }
        Ok(())
    }
}

struct DecodeState<B, E> {
    inner: BoxStream<'static, Result<B, E>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turn a raw SSE byte stream into a [`FragmentStream`].
///
/// Fragments come out one at a time in upstream order; the first error ends
/// the stream.
pub fn decode_stream<S, B, E>(inner: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DecodeState {
        inner: inner.boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(fragment) = st.pending.pop_front() {
                return Some((Ok(fragment), st));
            }
            if st.finished || st.decoder.is_done() {
                return None;
            }

            let step = match st.inner.next().await {
                Some(Ok(bytes)) => st.decoder.feed(bytes.as_ref()),
                Some(Err(e)) => Err(UpstreamError::Transient(format!("stream read error: {e}"))),
                None => {
                    st.finished = true;
                    st.decoder.finish()
                }
            };

            match step {
                Ok(fragments) => st.pending.extend(fragments),
                Err(e) => {
                    st.finished = true;
                    st.pending.clear();
                    return Some((Err(e), st));
                }
            }
        }
    })
    .boxed()
}
