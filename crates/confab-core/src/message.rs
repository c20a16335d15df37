use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, ConversationId, MessageId, UserId};

/// Author of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "sender_type", rename_all = "snake_case")]
pub enum Sender {
    User { user_id: UserId },
    Ai { agent_id: AgentId },
}

impl Sender {
    pub fn is_ai(&self) -> bool {
        matches!(self, Self::Ai { .. })
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::Ai { agent_id } => Some(agent_id),
            Self::User { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// One A2A consultation performed while producing an AI message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelegationTrace {
    pub specialist_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist_id: Option<AgentId>,
    pub query: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Generation accounting attached to AI-authored messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AiUsage {
    pub tokens: u64,
    pub response_time_ms: u64,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegations: Vec<DelegationTrace>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub content: String,
    pub status: MessageStatus,
    /// Agents addressed by `@name` in a human message, captured at send time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<AiUsage>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn from_user(
        conversation_id: ConversationId,
        user_id: UserId,
        content: impl Into<String>,
        mentions: Vec<AgentId>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender: Sender::User { user_id },
            content: content.into(),
            status: MessageStatus::Sent,
            mentions,
            usage: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_agent(
        conversation_id: ConversationId,
        agent_id: AgentId,
        content: impl Into<String>,
        status: MessageStatus,
        usage: AiUsage,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender: Sender::Ai { agent_id },
            content: content.into(),
            status,
            mentions: Vec::new(),
            usage: Some(usage),
            created_at: Utc::now(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == MessageStatus::Sent
    }

    pub fn tokens(&self) -> u64 {
        self.usage.as_ref().map_or(0, |u| u.tokens)
    }

    pub fn cost(&self) -> f64 {
        self.usage.as_ref().map_or(0.0, |u| u.cost)
    }

    /// Error text a client shows behind "view error".
    pub fn error(&self) -> Option<&str> {
        self.usage.as_ref().and_then(|u| u.error.as_deref())
    }
}
