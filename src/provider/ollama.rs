use super::ndjson::{self, LineAction};
use super::{GenerateFuture, GenerationStream, Provider, StreamState};
use crate::error::GenerateError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama2";

/// Local Ollama daemon, streaming `/api/generate`.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: Url,
    model: String,
}

impl OllamaProvider {
    pub fn new(http: reqwest::Client, base_url: &str, model: String) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            model,
        })
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

fn handle_line(line: &[u8]) -> LineAction {
    let parsed: GenerateLine = match serde_json::from_slice(line) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable ollama line");
            return LineAction::Skip;
        }
    };

    if let Some(err) = parsed.error {
        return LineAction::Fail(GenerateError::Backend(format!("ollama: {err}")));
    }
    // A final line may still carry text; the pump finishes at end of body.
    match (parsed.response.is_empty(), parsed.done) {
        (false, _) => LineAction::Emit(parsed.response),
        (true, true) => LineAction::Stop,
        (true, false) => LineAction::Skip,
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn generate(&self, prompt: String, cancel: CancellationToken) -> GenerateFuture {
        let http = self.http.clone();
        let this = self.clone();

        Box::pin(async move {
            let (producer, stream) = GenerationStream::channel(&cancel);
            let url = this
                .base_url
                .join("api/generate")
                .map_err(|e| GenerateError::InvalidConfig(format!("ollama base url: {e}")))?;

            let body = GenerateRequest {
                model: &this.model,
                prompt: &prompt,
                stream: true,
            };

            producer.set_state(StreamState::Sending);
            tracing::debug!(%url, model = %this.model, "sending ollama request");

            let send = http.post(url).json(&body).send();
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

            tokio::spawn(ndjson::pump(resp, producer, handle_line));
            Ok(stream)
        })
    }
}
