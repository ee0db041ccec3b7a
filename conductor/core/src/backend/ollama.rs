//! Ollama Backend Implementation
//!
//! Chat backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history; streamed as
//!   newline-delimited JSON frames when `stream` is true
//! - `/api/tags` - List available models (used as a health probe)

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{BackendError, ChatFrame, ChatRequest, LlmBackend, LlmResponse, StreamingToken};

/// Longest error body kept from a failed upstream response
pub(crate) const MAX_ERROR_BODY: usize = 512;

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    /// Base URL, e.g. `http://localhost:11434`
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend.
    ///
    /// `read_timeout` bounds the gap between two reads, so long generations
    /// keep streaming as long as frames keep arriving.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Client`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Base URL this backend talks to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    async fn post_chat(&self, request: &ChatRequest) -> Result<reqwest::Response, BackendError> {
        let response = self
            .http_client
            .post(self.chat_url())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_error_body(&mut body);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn chat_streaming(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        let (tx, rx) = mpsc::channel(100);
        let request = request.clone().with_stream(true);
        let response = self.post_chat(&request).await?;
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = FrameDecoder::default();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };

                for frame in decoder.push(&bytes) {
                    match forward_frame(frame, &mut full_response, &tx).await {
                        FrameFlow::Continue => {}
                        FrameFlow::Stop => return,
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                if let FrameFlow::Stop = forward_frame(frame, &mut full_response, &tx).await {
                    return;
                }
            }

            // Stream ended without a done frame
            let terminal = if full_response.is_empty() {
                StreamingToken::Error("backend closed the stream before any output".to_string())
            } else {
                StreamingToken::Complete {
                    message: full_response,
                }
            };
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<LlmResponse, BackendError> {
        let start = Instant::now();
        let request = request.clone().with_stream(false);
        let response = self.post_chat(&request).await?;

        let frame: ChatFrame = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedFrame(e.to_string()))?;
        if let Some(error) = frame.error {
            return Err(BackendError::Remote(error));
        }

        Ok(LlmResponse {
            content: frame.content().to_string(),
            model: if frame.model.is_empty() {
                request.model
            } else {
                frame.model
            },
            duration_ms: u64::try_from(start.elapsed().as_millis()).ok(),
        })
    }
}

enum FrameFlow {
    Continue,
    Stop,
}

async fn forward_frame(
    frame: Result<ChatFrame, BackendError>,
    full_response: &mut String,
    tx: &mpsc::Sender<StreamingToken>,
) -> FrameFlow {
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            let _ = tx.send(StreamingToken::Error(e.to_string())).await;
            return FrameFlow::Stop;
        }
    };

    if let Some(error) = frame.error {
        let _ = tx.send(StreamingToken::Error(error)).await;
        return FrameFlow::Stop;
    }

    let content = frame.content();
    if !content.is_empty() {
        full_response.push_str(content);
        if tx
            .send(StreamingToken::Token(content.to_string()))
            .await
            .is_err()
        {
            // Receiver dropped, stop streaming
            return FrameFlow::Stop;
        }
    }

    if frame.done {
        let _ = tx
            .send(StreamingToken::Complete {
                message: std::mem::take(full_response),
            })
            .await;
        return FrameFlow::Stop;
    }
    FrameFlow::Continue
}

/// Splits a byte stream into newline-delimited [`ChatFrame`]s.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Feed a chunk and return every complete frame it finished
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<ChatFrame, BackendError>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = decode_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<Result<ChatFrame, BackendError>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<ChatFrame, BackendError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(BackendError::MalformedFrame(e.to_string()))),
    };
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(|e| BackendError::MalformedFrame(e.to_string())))
}

/// Cut an upstream error body to [`MAX_ERROR_BODY`] bytes on a char boundary
pub(crate) fn truncate_error_body(body: &mut String) {
    body.truncate(floor_char_boundary(body, MAX_ERROR_BODY));
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}
