//! Text-completion backend.
//!
//! The [`Generator`] trait is the seam between the invocation runtime and the
//! model provider. Tests use scripted generators that replay canned outputs.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::config::GeneratorConfig;

/// One completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub text: String,
    pub stop_reason: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Failure talking to the generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("generator call timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not reach generator: {0}")]
    Connect(String),
    #[error("TLS failure talking to generator: {0}")]
    Tls(String),
    #[error("generator rate limited the call (429): {0}")]
    RateLimited(String),
    #[error("generator server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("generator rejected the call {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed completion body: {0}")]
    Malformed(String),
    #[error("generator is not configured: {0}")]
    NotConfigured(String),
}

impl TransportError {
    /// Timeouts, connection and TLS failures, rate limits, and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Connect(_)
                | TransportError::Tls(_)
                | TransportError::RateLimited(_)
                | TransportError::Server { .. }
        )
    }

    /// Short machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Tls(_) => "tls",
            TransportError::RateLimited(_) => "rate_limited",
            TransportError::Server { .. } => "server_error",
            TransportError::Rejected { .. } => "rejected",
            TransportError::Malformed(_) => "malformed",
            TransportError::NotConfigured(_) => "not_configured",
        }
    }
}

/// Abstraction over text-completion backends.
pub trait Generator: Send + Sync {
    /// Model name, used for token budgeting.
    fn model(&self) -> &str;

    /// Run one completion. Blocks for at most `request.timeout`.
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError>;
}

impl<G: Generator + ?Sized> Generator for std::sync::Arc<G> {
    fn model(&self) -> &str {
        (**self).model()
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        (**self).complete(request)
    }
}

#[derive(Debug, Deserialize)]
struct MessagesContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<MessagesContent>,
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

/// Generator backed by the Anthropic Messages API.
pub struct HttpGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_version: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("build generator http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_version: config.api_version.clone(),
            api_key: config.api_key(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Generator for HttpGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, max_tokens = request.max_tokens))]
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            TransportError::NotConfigured(format!(
                "{} is not set",
                crate::io::config::GENERATOR_API_KEY_ENV
            ))
        })?;
        let payload = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": [{"role": "user", "content": request.user}],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.api_version)
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .map_err(|err| classify_request_error(&err, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = truncate(&response.text().unwrap_or_default(), 320);
            warn!(status = status.as_u16(), "generator returned error status");
            return Err(classify_status(status, body, request.timeout));
        }

        // The request timeout also covers the body read.
        let raw = response
            .text()
            .map_err(|err| classify_request_error(&err, request.timeout))?;
        let body: MessagesResponse =
            serde_json::from_str(&raw).map_err(|err| TransportError::Malformed(err.to_string()))?;
        let text = body
            .content
            .iter()
            .filter(|part| part.content_type == "text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(TransportError::Malformed("no text content in completion".to_string()));
        }
        debug!(chars = text.len(), stop_reason = ?body.stop_reason, "completion received");
        Ok(Completion {
            text,
            stop_reason: body.stop_reason,
            input_tokens: body.usage.as_ref().and_then(|usage| usage.input_tokens),
            output_tokens: body.usage.as_ref().and_then(|usage| usage.output_tokens),
        })
    }
}

fn classify_request_error(err: &reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout(timeout);
    }
    let chain = error_chain(err);
    let lowered = chain.to_ascii_lowercase();
    if lowered.contains("tls") || lowered.contains("certificate") || lowered.contains("ssl") {
        TransportError::Tls(chain)
    } else if err.is_decode() {
        TransportError::Malformed(chain)
    } else {
        TransportError::Connect(chain)
    }
}

fn classify_status(status: StatusCode, body: String, timeout: Duration) -> TransportError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited(body),
        StatusCode::REQUEST_TIMEOUT => TransportError::Timeout(timeout),
        status if status.is_server_error() => TransportError::Server {
            status: status.as_u16(),
            body,
        },
        status => TransportError::Rejected {
            status: status.as_u16(),
            body,
        },
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
