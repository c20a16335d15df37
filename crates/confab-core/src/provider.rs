use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::ContextScope;
use crate::errors::{ContextError, GenerationError};
use crate::ids::{AgentId, OrganizationId};

/// Marker a generator emits on its own line to ask for a specialist:
/// `DELEGATE <specialist_key>: <query>`.
pub const DELEGATION_DIRECTIVE: &str = "DELEGATE ";

/// Where a block of context came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ContextSource {
    Scope { scope: ContextScope },
    History,
    Specialist { specialist_key: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    #[serde(flatten)]
    pub source: ContextSource,
    pub data: serde_json::Value,
}

impl ContextBlock {
    pub fn scope(scope: ContextScope, data: serde_json::Value) -> Self {
        Self {
            source: ContextSource::Scope { scope },
            data,
        }
    }

    pub fn specialist(key: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            source: ContextSource::Specialist {
                specialist_key: key.into(),
            },
            data: serde_json::Value::String(answer.into()),
        }
    }
}

/// Everything a generator needs for one reply.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub prompt: String,
    pub context: Vec<ContextBlock>,
    pub query: String,
    /// Specialist keys this agent may consult. Empty when it cannot delegate.
    pub available_specialists: Vec<String>,
}

/// A nested A2A request produced by an agent's reasoning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub specialist_key: String,
    pub query: String,
}

impl DelegationRequest {
    pub fn new(specialist_key: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            specialist_key: specialist_key.into(),
            query: query.into(),
        }
    }

    /// Split a `DELEGATE key: query` line out of generated text.
    /// Returns the remaining text and the first well-formed directive.
    pub fn extract(text: &str) -> (String, Option<Self>) {
        let mut found = None;
        let mut kept = Vec::new();
        for line in text.lines() {
            if found.is_none() {
                if let Some(rest) = line.trim_start().strip_prefix(DELEGATION_DIRECTIVE) {
                    if let Some((key, query)) = rest.split_once(':') {
                        let key = key.trim();
                        if !key.is_empty() && !key.contains(char::is_whitespace) {
                            found = Some(Self::new(key, query.trim()));
                            continue;
                        }
                    }
                }
            }
            kept.push(line);
        }
        (kept.join("\n").trim().to_string(), found)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedReply {
    pub text: String,
    pub tokens: u64,
    pub latency_ms: u64,
    pub cost: f64,
    pub delegation: Option<DelegationRequest>,
}

impl GeneratedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            delegation: None,
        }
    }
}

/// Reply generation capability (the language model side).
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError>;
}

/// Read-only loader for one named data domain.
#[async_trait]
pub trait ContextLoader: Send + Sync {
    async fn load(
        &self,
        scope: ContextScope,
        organization_id: &OrganizationId,
    ) -> Result<serde_json::Value, ContextError>;
}
