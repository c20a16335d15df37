use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use confab_core::errors::GenerationError;
use confab_core::provider::{DelegationRequest, GeneratedReply, GenerationRequest, ReplyGenerator};

use crate::converter;
use crate::models;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: models::CLAUDE_SONNET_4.name.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: 1024,
        }
    }
}

/// Reply generator backed by the Anthropic Messages API (non-streaming).
pub struct AnthropicGenerator {
    client: Client,
    api_key: SecretString,
    config: AnthropicConfig,
}

impl AnthropicGenerator {
    pub fn new(api_key: SecretString, config: AnthropicConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GenerationError::NetworkError(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn max_tokens(&self) -> u32 {
        models::find_model(&self.config.model)
            .map_or(self.config.max_tokens, |m| self.config.max_tokens.min(m.max_output))
    }
}

#[async_trait]
impl ReplyGenerator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip_all, fields(agent = %request.agent_name, model = %self.config.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError> {
        let body = converter::build_request_body(request, &self.config.model, self.max_tokens());
        let started = Instant::now();

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout(REQUEST_TIMEOUT)
                } else {
                    GenerationError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, body));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
        let parsed = converter::parse_response(&json)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (text, delegation) = if request.available_specialists.is_empty() {
            (parsed.text, None)
        } else {
            DelegationRequest::extract(&parsed.text)
        };
        debug!(
            input_tokens = parsed.input_tokens,
            output_tokens = parsed.output_tokens,
            latency_ms,
            delegating = delegation.is_some(),
            "reply generated"
        );

        Ok(GeneratedReply {
            text,
            tokens: parsed.input_tokens + parsed.output_tokens,
            latency_ms,
            cost: models::cost_for(&self.config.model, parsed.input_tokens, parsed.output_tokens),
            delegation,
        })
    }
}
