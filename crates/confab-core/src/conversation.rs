use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, ConversationId, OrganizationId, ParticipantId, UserId};

/// Policy deciding which agents answer a message that names nobody.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Only explicitly mentioned agents respond.
    #[default]
    OnDemand,
    /// Mentioned agents respond; without mentions, every active agent does.
    Moderated,
    /// Mentioned agents respond; without mentions, the next agent in turn does.
    RoundRobin,
    /// Every active agent responds to every message.
    Free,
}

impl ConversationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnDemand => "on_demand",
            Self::Moderated => "moderated",
            Self::RoundRobin => "round_robin",
            Self::Free => "free",
        }
    }

    /// Free mode fans every message out to every agent. Surfaces show this
    /// label next to the mode picker.
    pub fn caution(self) -> Option<&'static str> {
        match self {
            Self::Free => Some("every agent answers every message; cost and noise are uncapped"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_demand" => Ok(Self::OnDemand),
            "moderated" => Ok(Self::Moderated),
            "round_robin" => Ok(Self::RoundRobin),
            "free" => Ok(Self::Free),
            other => Err(format!("unknown conversation mode: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Paused,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// Who a participant is. Exactly one of the two references exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParticipantKind {
    Human { user_id: UserId },
    Agent { agent_id: AgentId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Member,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub kind: ParticipantKind,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn human(user_id: UserId, role: ParticipantRole) -> Self {
        Self {
            id: ParticipantId::new(),
            kind: ParticipantKind::Human { user_id },
            role,
            joined_at: Utc::now(),
            removed_at: None,
        }
    }

    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            id: ParticipantId::new(),
            kind: ParticipantKind::Agent { agent_id },
            role: ParticipantRole::Member,
            joined_at: Utc::now(),
            removed_at: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.removed_at.is_none()
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        match &self.kind {
            ParticipantKind::Agent { agent_id } => Some(agent_id),
            ParticipantKind::Human { .. } => None,
        }
    }
}

/// Running totals. Written only by the conversation manager on append.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub message_count: u64,
    pub ai_response_count: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub organization_id: OrganizationId,
    pub title: String,
    pub mode: ConversationMode,
    pub status: ConversationStatus,
    pub participants: Vec<Participant>,
    pub stats: ConversationStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_responder: Option<AgentId>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// New active conversation owned by `owner`.
    pub fn new(
        organization_id: OrganizationId,
        owner: UserId,
        title: impl Into<String>,
        mode: ConversationMode,
    ) -> Self {
        Self {
            id: ConversationId::new(),
            organization_id,
            title: title.into(),
            mode,
            status: ConversationStatus::Active,
            participants: vec![Participant::human(owner, ParticipantRole::Owner)],
            stats: ConversationStats::default(),
            last_responder: None,
            started_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == ConversationStatus::Paused
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn owner(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.role == ParticipantRole::Owner)
    }

    /// Agent ids of present agent participants, in join order.
    pub fn agent_participants(&self) -> Vec<AgentId> {
        self.participants
            .iter()
            .filter(|p| p.is_present())
            .filter_map(|p| p.agent_id().cloned())
            .collect()
    }

    pub fn has_agent(&self, agent_id: &AgentId) -> bool {
        self.participants
            .iter()
            .any(|p| p.is_present() && p.agent_id() == Some(agent_id))
    }

    pub fn has_user(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|p| {
            p.is_present() && matches!(&p.kind, ParticipantKind::Human { user_id: u } if u == user_id)
        })
    }
}
