use super::{GenerateFuture, GenerationStream, Producer, Provider, StreamState};
use crate::error::GenerateError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone)]
pub struct GoogleProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_base: Url,
}

impl GoogleProvider {
    pub fn new(http: reqwest::Client, api_key: String, model: String) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            api_key,
            model,
            api_base: Url::parse("https://generativelanguage.googleapis.com/")?,
        })
    }

    #[cfg(test)]
    fn with_api_base(mut self, base: &str) -> anyhow::Result<Self> {
        self.api_base = Url::parse(base)?;
        Ok(self)
    }

    fn build_url(&self) -> Result<Url, GenerateError> {
        // v1beta:streamGenerateContent supports Server-Sent Events with alt=sse.
        // Docs: https://ai.google.dev/api/rest/v1beta/models/streamGenerateContent
        let mut url = self
            .api_base
            .join(&format!("v1beta/models/{}:streamGenerateContent", self.model))
            .map_err(|e| GenerateError::InvalidConfig(format!("gemini url: {e}")))?;

        url.query_pairs_mut()
            .append_pair("key", &self.api_key)
            .append_pair("alt", "sse");
        Ok(url)
    }

    fn headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }
}

impl Provider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn generate(&self, prompt: String, cancel: CancellationToken) -> GenerateFuture {
        let http = self.http.clone();
        let this = self.clone();

        Box::pin(async move {
            let (producer, stream) = GenerationStream::channel(&cancel);
            let url = this.build_url()?;

            let body = StreamGenerateContentRequest {
                contents: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part { text: Some(prompt) }],
                }],
            };

            producer.set_state(StreamState::Sending);
            tracing::debug!(model = %this.model, "sending Gemini request");

            let send = http.post(url).headers(Self::headers()).json(&body).send();
            let Some(resp) = producer.until_cancelled(send).await else {
                return Ok(stream);
            };
            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    producer.set_state(StreamState::Failed);
                    return Err(GenerateError::Transport(e));
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let Some(body) = producer.until_cancelled(resp.text()).await else {
                    return Ok(stream);
                };
                producer.set_state(StreamState::Failed);
                return Err(GenerateError::Status {
                    status,
                    body: body.unwrap_or_default(),
                });
            }

            tokio::spawn(read_events(resp, producer));
            Ok(stream)
        })
    }
}

async fn read_events(resp: reqwest::Response, producer: Producer) {
    producer.set_state(StreamState::Streaming);
    let stream = resp.bytes_stream();
    let mut stream = std::pin::pin!(stream);
    let mut parser = SseParser::new();

    loop {
        let item = tokio::select! {
            biased;
            _ = producer.cancelled() => {
                producer.abandon();
                return;
            }
            item = stream.next() => item,
        };

        let bytes = match item {
            Some(Ok(b)) => b,
            Some(Err(e)) => {
                producer.fail(GenerateError::Transport(e)).await;
                return;
            }
            None => break,
        };

        for ev in parser.push(&bytes) {
            let SseEvent::Data(data) = ev else {
                continue;
            };
            if data.trim().is_empty() {
                continue;
            }

            let parsed: StreamGenerateContentResponse = match serde_json::from_str(&data) {
                Ok(r) => r,
                Err(e) => {
                    producer
                        .fail(GenerateError::Backend(format!("failed to parse SSE JSON: {e}")))
                        .await;
                    return;
                }
            };
            if let Some(text) = extract_text(&parsed) {
                if !producer.send(text).await {
                    producer.abandon();
                    return;
                }
            }
        }
    }

    producer.finish();
}

#[derive(Debug, Clone, Serialize)]
struct StreamGenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamGenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

fn extract_text(r: &StreamGenerateContentResponse) -> Option<String> {
    // Concatenate all text parts of the first candidate.
    let cand = r.candidates.first()?;
    let content = cand.content.as_ref()?;
    let out: String = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if out.is_empty() { None } else { Some(out) }
}

#[derive(Debug, Clone, PartialEq)]
enum SseEvent {
    Data(String),
    Other,
}

/// Minimal SSE parser.
///
/// - Collects UTF-8 lines
/// - Emits Data events when a blank line ends an event
struct SseParser {
    buf: Vec<u8>,
    cur_data: String,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            cur_data: String::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }

            if line.is_empty() {
                if !self.cur_data.is_empty() {
                    // Remove trailing newline from data field accumulation.
                    if self.cur_data.ends_with('\n') {
                        self.cur_data.pop();
                    }
                    out.push(SseEvent::Data(std::mem::take(&mut self.cur_data)));
                }
                continue;
            }

            let Ok(s) = std::str::from_utf8(&line) else {
                tracing::warn!("skipping SSE line that is not valid UTF-8");
                continue;
            };

            if let Some(rest) = s.strip_prefix("data:") {
                // A single leading space after the colon is optional.
                let rest = rest.strip_prefix(' ').unwrap_or(rest);
                self.cur_data.push_str(rest);
                self.cur_data.push('\n');
            } else {
                // Ignore other fields: event:, id:, retry:, comments
                out.push(SseEvent::Other);
            }
        }

        out
    }
}
