//! Client for the agent invocation service (`POST /invoke/{role}`).

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::{MessageEnvelope, ValidatedResponse};
use crate::io::generator::truncate;
use crate::runtime::AgentInvoker;

/// Error body returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceError {
    pub error: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub human_message: String,
}

pub struct HttpAgentClient {
    client: Client,
    base_url: String,
}

impl HttpAgentClient {
    /// `timeout` bounds a whole invocation, repairs and retries included.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build agent service http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, request: &MessageEnvelope) -> String {
        format!("{}/invoke/{}", self.base_url, request.agent.endpoint_slug())
    }
}

impl AgentInvoker for HttpAgentClient {
    #[instrument(skip_all, fields(role = %request.agent, mode = %request.mode, request_id = %request.request_id))]
    fn dispatch(&self, request: &MessageEnvelope) -> Result<ValidatedResponse> {
        let url = self.endpoint(request);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .with_context(|| format!("call agent service {url}"))?;
        let status = response.status();
        let body = response.text().context("read agent service response")?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<ServiceError>(&body) {
                Ok(err) => {
                    let message = if err.human_message.is_empty() {
                        err.error
                    } else {
                        err.human_message
                    };
                    anyhow!(
                        "agent service returned {status} ({}): {message}",
                        err.error_type
                    )
                }
                Err(_) => anyhow!("agent service returned {status}: {}", truncate(&body, 320)),
            });
        }
        let validated: ValidatedResponse =
            serde_json::from_str(&body).context("decode agent service response")?;
        debug!(
            status = %validated.envelope.status,
            artifacts = validated.envelope.artifacts.len(),
            "agent service replied"
        );
        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AgentRole, Mode};

    #[test]
    fn endpoint_uses_role_slug() {
        let timeout = Duration::from_secs(5);
        let client = HttpAgentClient::new("http://agents:8000/", timeout).expect("client");
        let request = MessageEnvelope::new(
            "p1",
            AgentRole::Devops,
            Mode::ProvisionArtifacts,
            "Provision",
        );
        assert_eq!(
            client.endpoint(&request),
            "http://agents:8000/invoke/devops"
        );
    }

    #[test]
    fn service_error_body_decodes_without_traceback() {
        let body = concat!(
            r#"{"error": "unknown role 'designer'", "error_type": "bad_request", "#,
            r#""human_message": "Role not found"}"#,
        );
        let err: ServiceError = serde_json::from_str(body).expect("decode");
        assert_eq!(err.error_type, "bad_request");
        assert_eq!(err.human_message, "Role not found");
    }
}
