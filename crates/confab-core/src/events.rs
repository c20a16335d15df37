use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationMode, ConversationStatus, Participant};
use crate::ids::{ConversationId, ParticipantId};
use crate::message::Message;

/// Conversation lifecycle events emitted by the engine after each committed
/// mutation, in commit order per conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "message_appended")]
    MessageAppended {
        conversation_id: ConversationId,
        message: Message,
    },

    #[serde(rename = "settings_updated")]
    SettingsUpdated {
        conversation_id: ConversationId,
        mode: ConversationMode,
        status: ConversationStatus,
    },

    #[serde(rename = "participant_added")]
    ParticipantAdded {
        conversation_id: ConversationId,
        participant: Participant,
    },

    #[serde(rename = "participant_removed")]
    ParticipantRemoved {
        conversation_id: ConversationId,
        participant_id: ParticipantId,
    },

    #[serde(rename = "conversation_archived")]
    ConversationArchived {
        conversation_id: ConversationId,
        archived_at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageAppended {
                conversation_id, ..
            }
            | Self::SettingsUpdated {
                conversation_id, ..
            }
            | Self::ParticipantAdded {
                conversation_id, ..
            }
            | Self::ParticipantRemoved {
                conversation_id, ..
            }
            | Self::ConversationArchived {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageAppended { .. } => "message_appended",
            Self::SettingsUpdated { .. } => "settings_updated",
            Self::ParticipantAdded { .. } => "participant_added",
            Self::ParticipantRemoved { .. } => "participant_removed",
            Self::ConversationArchived { .. } => "conversation_archived",
        }
    }
}
