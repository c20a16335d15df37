use std::time::Duration;

use confab_core::errors::{ContextError, GenerationError};
use confab_core::ids::{AgentId, ConversationId, ParticipantId};
use confab_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("conversation is paused: {0}")]
    ConversationPaused(ConversationId),

    #[error("conversation is archived: {0}")]
    ConversationArchived(ConversationId),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("agent is inactive: {0}")]
    AgentInactive(AgentId),

    #[error("the conversation owner cannot be removed")]
    CannotRemoveOwner,

    #[error("already a participant: {0}")]
    DuplicateParticipant(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("built-in agents cannot be deleted: {0}")]
    CannotDeleteBuiltIn(AgentId),

    #[error("conversation has no user message to answer: {0}")]
    NoUserMessage(ConversationId),

    #[error("generation failed: {0}")]
    GenerationFailed(#[from] GenerationError),

    #[error("context load failed: {0}")]
    ContextLoadFailed(#[from] ContextError),

    #[error("specialist {specialist_key} tried to delegate further")]
    DelegationDepthExceeded { specialist_key: String },

    #[error("no active specialist for key {0}")]
    SpecialistNotFound(String),

    #[error("specialist {0} cannot be orchestrated")]
    SpecialistNotOrchestrable(String),

    #[error("invocation timed out after {0:?}")]
    InvocationTimeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable identifier used on the wire and in failed-message error text.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::ConversationPaused(_) => "conversation_paused",
            Self::ConversationArchived(_) => "conversation_archived",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::AgentInactive(_) => "agent_inactive",
            Self::CannotRemoveOwner => "cannot_remove_owner",
            Self::DuplicateParticipant(_) => "duplicate_participant",
            Self::ParticipantNotFound(_) => "participant_not_found",
            Self::CannotDeleteBuiltIn(_) => "cannot_delete_built_in",
            Self::NoUserMessage(_) => "no_user_message",
            Self::GenerationFailed(_) => "generation_failed",
            Self::ContextLoadFailed(_) => "context_load_failed",
            Self::DelegationDepthExceeded { .. } => "delegation_depth_exceeded",
            Self::SpecialistNotFound(_) => "specialist_not_found",
            Self::SpecialistNotOrchestrable(_) => "specialist_not_orchestrable",
            Self::InvocationTimeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Store(_) => "store_error",
        }
    }

    /// Text stored on a failed AI message.
    pub fn failure_text(&self) -> String {
        match self {
            Self::InvocationTimeout(_) => "timeout".to_string(),
            Self::GenerationFailed(e) => format!("{}: {e}", e.error_kind()),
            other => format!("{}: {other}", other.error_kind()),
        }
    }
}
