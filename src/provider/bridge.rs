//! Configurable bridge to any HTTP endpoint that streams newline-delimited JSON.
//!
//! The operator describes the request in `remote_config.json`: where to POST,
//! which headers to send, a JSON body template with a `"<PROMPT>"` string
//! somewhere inside, and the name of the field carrying generated text in
//! each response line.

use super::ndjson::{self, LineAction};
use super::{GenerateFuture, GenerationStream, Provider, StreamState};
use crate::error::GenerateError;
use crate::json_template::{self, PROMPT_PLACEHOLDER};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Written on first run so the operator has something to edit.
pub const DEFAULT_BRIDGE_CONFIG: &str = r#"{
  "api_config": {
    "url": "https://api.example.com/endpoint/v1/chat/completions",
    "headers": {
      "Content-Type": "application/json",
      "Accept": "application/json"
    },
    "data_template": {
      "model": "example-model",
      "messages": "<PROMPT>"
    },
    "field_to_extract": "response"
  }
}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BridgeConfigFile {
    api_config: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub url: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Any JSON value; every `"<PROMPT>"` string in it becomes the prompt.
    pub data_template: serde_json::Value,

    /// Field searched for in each response line.
    pub field_to_extract: String,
}

impl BridgeConfig {
    /// Load and validate the config at `path`.
    ///
    /// A missing file is replaced by the default template and reported as
    /// `SetupRequired`; the caller should stop and tell the user to edit it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GenerateError> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_default(path)?;
                tracing::info!(path = %path.display(), "created default bridge config");
                return Err(GenerateError::SetupRequired {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(GenerateError::ConfigIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let file: BridgeConfigFile =
            serde_json::from_slice(&bytes).map_err(|source| GenerateError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        let cfg = file.api_config;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), GenerateError> {
        if self.url.trim().is_empty() {
            return Err(GenerateError::InvalidConfig("api_config.url is empty".into()));
        }
        if self.field_to_extract.is_empty() {
            return Err(GenerateError::InvalidConfig(
                "api_config.field_to_extract is empty".into(),
            ));
        }
        if !contains_placeholder(&self.data_template) {
            tracing::debug!("data_template has no \"{PROMPT_PLACEHOLDER}\"; body will be sent as-is");
        }
        Ok(())
    }

    /// Configured headers, as written, ready for reqwest.
    pub fn header_map(&self) -> Result<HeaderMap, GenerateError> {
        let mut h = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let n = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GenerateError::InvalidConfig(format!("header name {name:?}: {e}")))?;
            let v = HeaderValue::from_str(value)
                .map_err(|e| GenerateError::InvalidConfig(format!("header {name}: {e}")))?;
            h.append(n, v);
        }
        Ok(h)
    }

    /// Request body for `prompt`, serialized.
    pub fn render_body(&self, prompt: &str) -> Result<Vec<u8>, GenerateError> {
        let body = json_template::substitute(self.data_template.clone(), PROMPT_PLACEHOLDER, prompt);
        serde_json::to_vec(&body).map_err(GenerateError::Serialize)
    }
}

/// Write the default template to `path`. Refuses to clobber an existing file
/// unless `force` is set. Returns whether a file was written.
pub fn init_default(path: &Path, force: bool) -> anyhow::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    write_default(path)?;
    Ok(true)
}

fn write_default(path: &Path) -> Result<(), GenerateError> {
    let io_err = |source| GenerateError::ConfigIo {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    std::fs::write(path, DEFAULT_BRIDGE_CONFIG).map_err(io_err)
}

fn contains_placeholder(v: &serde_json::Value) -> bool {
    use serde_json::Value;
    match v {
        Value::String(s) => s == PROMPT_PLACEHOLDER,
        Value::Array(items) => items.iter().any(contains_placeholder),
        Value::Object(map) => map.values().any(contains_placeholder),
        Value::Number(_) | Value::Bool(_) | Value::Null => false,
    }
}

/// Decide what one response line contributes to the output.
fn handle_line(line: &[u8], field: &str) -> LineAction {
    let value: serde_json::Value = match serde_json::from_slice(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, line = %String::from_utf8_lossy(line), "skipping undecodable response line");
            return LineAction::Skip;
        }
    };

    match json_template::extract(&value, field) {
        Some(text) if !text.is_empty() => LineAction::Emit(text),
        _ => LineAction::Skip,
    }
}

#[derive(Debug, Clone)]
pub struct BridgeProvider {
    http: reqwest::Client,
    config_path: PathBuf,
}

impl BridgeProvider {
    pub fn new(http: reqwest::Client, config_path: PathBuf) -> Self {
        Self { http, config_path }
    }
}

impl Provider for BridgeProvider {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn generate(&self, prompt: String, cancel: CancellationToken) -> GenerateFuture {
        let http = self.http.clone();
        let config_path = self.config_path.clone();

        Box::pin(async move {
            let (producer, stream) = GenerationStream::channel(&cancel);

            // Fresh copy per request; nothing carries over between prompts.
            let cfg = BridgeConfig::load(&config_path)?;
            let headers = cfg.header_map()?;
            let body = cfg.render_body(&prompt)?;

            producer.set_state(StreamState::Sending);
            tracing::debug!(url = %cfg.url, bytes = body.len(), "sending bridge request");

            let send = http.post(&cfg.url).headers(headers).body(body).send();
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

            let field = cfg.field_to_extract;
            tokio::spawn(ndjson::pump(resp, producer, move |line| {
                handle_line(line, &field)
            }));

            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_stream::StreamExt;

    fn write_config(dir: &Path, url: &str, field: &str) -> PathBuf {
        let path = dir.join("remote_config.json");
        let cfg = json!({
            "api_config": {
                "url": url,
                "headers": {"Content-Type": "application/json", "X-Api-Key": "secret"},
                "data_template": {"q": "<PROMPT>"},
                "field_to_extract": field
            }
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&cfg).unwrap()).unwrap();
        path
    }

    async fn collect(mut stream: GenerationStream) -> (Vec<String>, Option<GenerateError>) {
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(c) => chunks.push(c.text),
                Err(e) => return (chunks, Some(e)),
            }
        }
        (chunks, None)
    }

    #[test]
    fn missing_config_writes_default_and_requires_setup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("remote_config.json");

        let err = BridgeConfig::load(&path).unwrap_err();
        assert!(matches!(err, GenerateError::SetupRequired { .. }));
        assert!(err.is_setup());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_BRIDGE_CONFIG);

        // The written default is itself loadable.
        let cfg = BridgeConfig::load(&path).unwrap();
        assert_eq!(cfg.field_to_extract, "response");
        assert_eq!(cfg.headers.len(), 2);
        assert_eq!(cfg.data_template["messages"], json!("<PROMPT>"));
    }

    #[test]
    fn malformed_config_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_config.json");
        std::fs::write(&path, "{\"api_config\": {").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path).unwrap_err(),
            GenerateError::ConfigParse { .. }
        ));

        std::fs::write(&path, r#"{"api_config": {"url": "http://x", "field_to_extract": "a"}}"#)
            .unwrap();
        assert!(matches!(
            BridgeConfig::load(&path).unwrap_err(),
            GenerateError::ConfigParse { .. }
        ));
    }

    #[test]
    fn empty_url_is_rejected_and_headers_default_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_config.json");
        std::fs::write(
            &path,
            r#"{"api_config": {"url": " ", "data_template": {}, "field_to_extract": "a"}}"#,
        )
        .unwrap();
        assert!(matches!(
            BridgeConfig::load(&path).unwrap_err(),
            GenerateError::InvalidConfig(_)
        ));

        std::fs::write(
            &path,
            r#"{"api_config": {"url": "http://x/y", "data_template": "<PROMPT>", "field_to_extract": "a"}}"#,
        )
        .unwrap();
        let cfg = BridgeConfig::load(&path).unwrap();
        assert!(cfg.headers.is_empty());
        assert_eq!(cfg.render_body("hi").unwrap(), br#""hi""#.to_vec());
    }

    #[test]
    fn init_default_respects_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "http://x/y", "answer");
        assert!(!init_default(&path, false).unwrap());
        assert!(std::fs::read_to_string(&path).unwrap().contains("http://x/y"));
        assert!(init_default(&path, true).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_BRIDGE_CONFIG);
    }

    #[test]
    fn invalid_header_is_a_config_error() {
        let cfg = BridgeConfig {
            url: "http://x".into(),
            headers: BTreeMap::from([("bad header".to_string(), "v".to_string())]),
            data_template: json!("<PROMPT>"),
            field_to_extract: "a".into(),
        };
        assert!(matches!(cfg.header_map().unwrap_err(), GenerateError::InvalidConfig(_)));
    }

    #[test]
    fn line_handling_skips_bad_json_and_misses() {
        assert!(matches!(handle_line(br#"{"answer":"he"}"#, "answer"), LineAction::Emit(t) if t == "he"));
        assert!(matches!(handle_line(b"{not json", "answer"), LineAction::Skip));
        assert!(matches!(handle_line(br#"{"other":1}"#, "answer"), LineAction::Skip));
        assert!(matches!(handle_line(br#"{"answer":""}"#, "answer"), LineAction::Skip));
    }

    #[tokio::test]
    async fn streams_extracted_chunks_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/y")
            .match_header("x-api-key", "secret")
            .match_body(mockito::Matcher::JsonString(r#"{"q":"hi"}"#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body("{\"answer\":\"he\"}\n{\"answer\":\"llo\"}\n")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("{}/y", server.url()), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);

        let stream = provider
            .generate("hi".to_string(), CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(stream).await;

        mock.assert_async().await;
        assert!(err.is_none());
        assert_eq!(chunks, ["he", "llo"]);
        assert_eq!(chunks.concat(), "hello");
    }

    #[tokio::test]
    async fn malformed_line_between_valid_lines_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/gen")
            .with_status(200)
            .with_body("{\"data\":{\"answer\":\"one\"}}\n{oops\n{\"data\":{\"answer\":\"two\"}}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("{}/gen", server.url()), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);

        let mut stream = provider
            .generate("x".to_string(), CancellationToken::new())
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            chunks.push(item.unwrap().text);
        }
        assert_eq!(chunks, ["one", "two"]);
        assert_eq!(stream.state(), StreamState::Done);
    }

    #[tokio::test]
    async fn http_error_status_fails_before_streaming() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/gen")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("{}/gen", server.url()), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);

        let err = provider
            .generate("x".to_string(), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GenerateError::Status { status, body } => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("http://{addr}/gen"), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);

        let err = provider
            .generate("x".to_string(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Transport(_)));
        assert!(!err.is_setup());
    }

    #[tokio::test]
    async fn missing_config_fails_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_config.json");
        let provider = BridgeProvider::new(reqwest::Client::new(), path.clone());

        let err = provider
            .generate("x".to_string(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_setup());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn chunks_keep_response_order_across_misses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/gen")
            .with_status(200)
            .with_body(concat!(
                "{\"answer\":\"a\"}\n",
                "{\"meta\":{\"id\":1}}\n",
                "{\"answer\":{\"tokens\":3}}\n",
                "{\"choices\":[{\"answer\":\"b\"}]}\r\n",
                "\n",
                "{\"answer\":\"\"}\n",
                "{\"answer\":\"c\"}",
            ))
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("{}/gen", server.url()), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);

        let stream = provider
            .generate("x".to_string(), CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(stream).await;
        assert!(err.is_none());
        assert_eq!(chunks, ["a", "found, but not a string: object", "b", "c"]);
    }

    /// Accepts one request, writes `response`, then holds the socket open.
    async fn stalled_server(response: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(response.as_bytes()).await.unwrap();
            while let Ok(n) = sock.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        addr
    }

    async fn generate_then_cancel(addr: std::net::SocketAddr) -> GenerationStream {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("http://{addr}/gen"), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);
        let cancel = CancellationToken::new();

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });

        tokio::time::timeout(
            std::time::Duration::from_secs(3),
            provider.generate("x".to_string(), cancel),
        )
        .await
        .expect("generate should return once cancelled")
        .unwrap()
    }

    #[tokio::test]
    async fn cancelling_interrupts_a_stalled_error_body() {
        let addr = stalled_server(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\npartial",
        )
        .await;

        let mut stream = generate_then_cancel(addr).await;
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), StreamState::Failed);
    }

    #[tokio::test]
    async fn cancelling_interrupts_a_request_waiting_for_headers() {
        let addr = stalled_server("").await;

        let mut stream = generate_then_cancel(addr).await;
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), StreamState::Failed);
    }

    /// Serves a chunked body that stops mid-chunk, then hangs up.
    async fn truncated_chunked_server() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let first = "{\"answer\":\"he\"}\n";
            let head = "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
            let partial = format!("{head}{:x}\r\n{first}\r\n40\r\n{{\"answer\"", first.len());
            sock.write_all(partial.as_bytes()).await.unwrap();
            sock.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });
        addr
    }

    #[tokio::test]
    async fn mid_stream_transport_error_ends_stream_with_failure() {
        let addr = truncated_chunked_server().await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("http://{addr}/gen"), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);

        let stream = provider
            .generate("x".to_string(), CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(stream).await;
        assert_eq!(chunks, ["he"]);
        assert!(matches!(err, Some(GenerateError::Transport(_))));
    }

    #[tokio::test]
    async fn cancelling_stops_the_reader() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let line = "{\"answer\":\"tick\"}\n";
            let head = "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
            let msg = format!("{head}{:x}\r\n{line}\r\n", line.len());
            sock.write_all(msg.as_bytes()).await.unwrap();
            // Never finish the body; wait for the client to hang up.
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = closed_tx.send(());
        });

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("http://{addr}/gen"), "answer");
        let provider = BridgeProvider::new(reqwest::Client::new(), path);
        let cancel = CancellationToken::new();

        let mut stream = provider.generate("x".to_string(), cancel.clone()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().text, "tick");

        cancel.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), StreamState::Failed);

        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), closed_rx)
            .await
            .expect("connection should be closed after cancellation")
            .unwrap();
    }
}
