//! HTTP client for the inference service.
//!
//! Two endpoints are used: `POST /api/command` answers with an NDJSON body
//! that is handed back as a raw byte stream for the event decoder, and
//! `GET /api/models` lists the models the service can route to.

mod error;
mod types;

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};

pub use error::{TransportError, TransportErrorKind};
pub use types::{CommandRequest, HistoryEntry};
use types::ModelsResponse;

use crate::config::Config;

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("aman/", env!("CARGO_PKG_VERSION"));

const COMMAND_PATH: &str = "/api/command";
const MODELS_PATH: &str = "/api/models";

/// Raw response body of a command invocation.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    /// Builds a client for `base_url` with an optional connect timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, connect_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Builds a client from resolved configuration.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config.resolved_base_url()?;
        Self::new(&base_url, config.connect_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a command and returns the response body as a byte stream.
    ///
    /// The connection stays open until the returned stream is exhausted or
    /// dropped; dropping it aborts the request.
    ///
    /// # Errors
    /// Returns a `TransportError` if the request cannot be sent, the status
    /// is not a success, or the response has no body.
    pub async fn send_command(&self, request: &CommandRequest) -> Result<ByteStream, TransportError> {
        let url = format!("{}{}", self.base_url, COMMAND_PATH);
        tracing::debug!(
            url = %url,
            command = %request.command,
            session_id = %request.session_id,
            history = request.history.len(),
            "Sending command"
        );

        let response = self
            .http
            .post(&url)
            .headers(command_headers())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status.as_u16(), &error_body));
        }
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(TransportError::missing_body());
        }

        Ok(response.bytes_stream().map_err(TransportError::from).boxed())
    }

    /// Fetches the identifiers of the available models.
    ///
    /// Null entries are skipped. An `error` field reported by the service is
    /// logged; whatever models came along are still returned.
    ///
    /// # Errors
    /// Returns a `TransportError` on network failure, non-success status or
    /// an unparseable body.
    pub async fn list_models(&self) -> Result<Vec<String>, TransportError> {
        let url = format!("{}{}", self.base_url, MODELS_PATH);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status.as_u16(), &error_body));
        }

        let body = response.text().await?;
        let parsed: ModelsResponse = serde_json::from_str(&body).map_err(|err| TransportError {
            kind: TransportErrorKind::Parse,
            message: format!("Invalid models response: {err}"),
            details: Some(body.clone()),
        })?;

        if let Some(error) = parsed.error {
            tracing::warn!(error = %error, "Model listing reported an error");
        }
        Ok(parsed.models.into_iter().flatten().collect())
    }
}

fn command_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("application/x-ndjson"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(input: &str) -> CommandRequest {
        CommandRequest {
            command: "/align".into(),
            user_input: input.into(),
            session_id: "s1".into(),
            history: Vec::new(),
            model: "llama3".into(),
        }
    }

    async fn collect_body(stream: ByteStream) -> String {
        let parts: Vec<Bytes> = stream.try_collect().await.unwrap();
        parts
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_send_command_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .and(header("accept", "application/x-ndjson"))
            .and(body_partial_json(serde_json::json!({
                "command": "/align",
                "user_input": "hi",
                "model": "llama3"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("{\"type\":\"chunk\",\"content\":\"ok\"}\n", "application/x-ndjson"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = InferenceClient::new(&server.uri(), None).unwrap();
        let stream = client.send_command(&request("hi")).await.unwrap();

        assert_eq!(collect_body(stream).await, "{\"type\":\"chunk\",\"content\":\"ok\"}\n");
    }

    #[tokio::test]
    async fn test_send_command_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"detail":"boom"}"#))
            .mount(&server)
            .await;

        let client = InferenceClient::new(&server.uri(), None).unwrap();
        let err = client.send_command(&request("hi")).await.err().unwrap();

        assert_eq!(err.kind, TransportErrorKind::HttpStatus);
        assert_eq!(err.to_string(), "HTTP 500: boom");
    }

    #[tokio::test]
    async fn test_send_command_no_content_is_missing_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = InferenceClient::new(&server.uri(), None).unwrap();
        let err = client.send_command(&request("hi")).await.err().unwrap();

        assert_eq!(err.kind, TransportErrorKind::MissingBody);
    }

    #[tokio::test]
    async fn test_send_command_empty_body_is_missing_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = InferenceClient::new(&server.uri(), None).unwrap();
        let err = client.send_command(&request("hi")).await.err().unwrap();

        assert_eq!(err.kind, TransportErrorKind::MissingBody);
        assert_eq!(err.to_string(), "No response body");
    }

    #[tokio::test]
    async fn test_send_command_connection_refused() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = InferenceClient::new(&format!("http://{addr}"), None).unwrap();

        let err = client.send_command(&request("hi")).await.err().unwrap();

        assert_eq!(err.kind, TransportErrorKind::Connect);
    }

    #[tokio::test]
    async fn test_list_models_skips_nulls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"models": ["llama3", null, "mistral"]})),
            )
            .mount(&server)
            .await;

        let client = InferenceClient::new(&format!("{}/", server.uri()), None).unwrap();
        let models = client.list_models().await.unwrap();

        assert_eq!(models, vec!["llama3", "mistral"]);
    }

    #[tokio::test]
    async fn test_list_models_rejects_garbage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = InferenceClient::new(&server.uri(), None).unwrap();
        let err = client.list_models().await.unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::Parse);
    }
}
