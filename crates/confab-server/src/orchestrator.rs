//! Conversation orchestrator: connects the engine to the server.
//!
//! The [`ConversationOrchestrator`] trait is the inbound command surface.
//! [`EngineOrchestrator`] implements it over the conversation manager, the
//! agent directory, and the agent pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use confab_core::conversation::{Conversation, ConversationMode, Participant, ParticipantKind};
use confab_core::ids::{AgentId, ConversationId, OrganizationId, ParticipantId, UserId};
use confab_core::message::Message;
use confab_engine::{
    parse_mentions, route, AgentDirectory, AgentPool, ConversationManager, EngineError,
    InvocationPermit, SettingsUpdate,
};

/// Which agents an explicit invocation addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationTarget {
    /// These agents, which must be present participants.
    Agents(Vec<AgentId>),
    /// Every active agent participant.
    All,
    /// Active participants mentioned in the last user message.
    MentionedOnly,
    /// Whatever the conversation mode selects for the last user message.
    Routed,
}

#[derive(Clone, Debug)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub content: String,
}

/// A user message and the agent replies it produced.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub message: Message,
    pub replies: Vec<Message>,
}

#[async_trait]
pub trait ConversationOrchestrator: Send + Sync {
    fn create_conversation(
        &self,
        organization_id: OrganizationId,
        owner: UserId,
        title: String,
        mode: ConversationMode,
    ) -> Result<Conversation, EngineError>;

    async fn conversation(&self, id: &ConversationId) -> Result<Conversation, EngineError>;

    fn list_conversations(&self, organization_id: &OrganizationId) -> Result<Vec<Conversation>, EngineError>;

    async fn messages(&self, id: &ConversationId, limit: Option<usize>) -> Result<Vec<Message>, EngineError>;

    /// Append a user message with its mentions resolved. Invokes nobody.
    async fn send_message(&self, params: SendMessage) -> Result<Message, EngineError>;

    /// Invoke agents against the conversation's last user message.
    /// Generation failures come back as Failed messages, not errors.
    async fn invoke_agents(
        &self,
        id: &ConversationId,
        target: InvocationTarget,
    ) -> Result<Vec<Message>, EngineError>;

    /// Send, then invoke whatever the mode routes the message to.
    async fn send_and_respond(&self, params: SendMessage) -> Result<SendOutcome, EngineError>;

    async fn update_settings(
        &self,
        id: &ConversationId,
        update: SettingsUpdate,
    ) -> Result<Conversation, EngineError>;

    async fn add_participant(
        &self,
        id: &ConversationId,
        kind: ParticipantKind,
    ) -> Result<Participant, EngineError>;

    async fn remove_participant(
        &self,
        id: &ConversationId,
        participant_id: &ParticipantId,
    ) -> Result<Conversation, EngineError>;

    async fn archive(&self, id: &ConversationId) -> Result<Conversation, EngineError>;
}

/// Production orchestrator backed by the engine crate.
pub struct EngineOrchestrator {
    conversations: Arc<ConversationManager>,
    directory: Arc<AgentDirectory>,
    pool: Arc<AgentPool>,
}

impl EngineOrchestrator {
    pub fn new(
        conversations: Arc<ConversationManager>,
        directory: Arc<AgentDirectory>,
        pool: Arc<AgentPool>,
    ) -> Self {
        Self {
            conversations,
            directory,
            pool,
        }
    }

    /// Present agent participants whose records are active, in join order.
    fn active_agents(&self, conversation: &Conversation) -> Vec<AgentId> {
        conversation
            .agent_participants()
            .into_iter()
            .filter(|id| match self.directory.get(id) {
                Ok(agent) => agent.is_active,
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "participant agent unavailable");
                    false
                }
            })
            .collect()
    }

    fn resolve_targets(
        &self,
        permit: &InvocationPermit,
        trigger: &Message,
        target: InvocationTarget,
    ) -> Result<Vec<AgentId>, EngineError> {
        let conversation = permit.conversation();
        let active = self.active_agents(conversation);
        let targets = match target {
            InvocationTarget::Agents(ids) => {
                let present = conversation.agent_participants();
                let mut targets: Vec<AgentId> = Vec::with_capacity(ids.len());
                for id in ids {
                    if !present.contains(&id) {
                        return Err(EngineError::InvalidRequest(format!(
                            "agent {id} is not a participant"
                        )));
                    }
                    if !targets.contains(&id) {
                        targets.push(id);
                    }
                }
                targets
            }
            InvocationTarget::All => active,
            InvocationTarget::MentionedOnly => active
                .into_iter()
                .filter(|id| trigger.mentions.contains(id))
                .collect(),
            InvocationTarget::Routed => route(
                conversation.mode,
                &trigger.mentions,
                &conversation.agent_participants(),
                |id| active.contains(id),
                conversation.last_responder.as_ref(),
            ),
        };
        Ok(targets)
    }

    async fn respond(
        &self,
        permit: InvocationPermit,
        trigger: &Message,
        target: InvocationTarget,
    ) -> Result<Vec<Message>, EngineError> {
        let targets = self.resolve_targets(&permit, trigger, target)?;
        if targets.is_empty() {
            debug!(conversation_id = %permit.conversation_id(), "no agents selected");
            return Ok(Vec::new());
        }
        info!(
            conversation_id = %permit.conversation_id(),
            agents = targets.len(),
            mode = %permit.conversation().mode,
            "invoking agents"
        );
        self.pool.invoke_all(&permit, &targets, &trigger.content).await
    }
}

#[async_trait]
impl ConversationOrchestrator for EngineOrchestrator {
    fn create_conversation(
        &self,
        organization_id: OrganizationId,
        owner: UserId,
        title: String,
        mode: ConversationMode,
    ) -> Result<Conversation, EngineError> {
        self.conversations
            .create_conversation(organization_id, owner, title, mode)
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Conversation, EngineError> {
        self.conversations.get(id).await
    }

    fn list_conversations(&self, organization_id: &OrganizationId) -> Result<Vec<Conversation>, EngineError> {
        self.conversations.list(organization_id)
    }

    async fn messages(&self, id: &ConversationId, limit: Option<usize>) -> Result<Vec<Message>, EngineError> {
        self.conversations.messages(id, limit).await
    }

    #[instrument(skip_all, fields(conversation_id = %params.conversation_id, user_id = %params.user_id))]
    async fn send_message(&self, params: SendMessage) -> Result<Message, EngineError> {
        if params.content.trim().is_empty() {
            return Err(EngineError::InvalidRequest("message content must not be empty".into()));
        }
        let conversation = self.conversations.get(&params.conversation_id).await?;
        let candidates: Vec<(AgentId, String)> = conversation
            .agent_participants()
            .into_iter()
            .filter_map(|id| self.directory.get(&id).ok().map(|agent| (id, agent.name.clone())))
            .collect();
        let mentions = parse_mentions(
            &params.content,
            candidates.iter().map(|(id, name)| (id, name.as_str())),
        );
        self.conversations
            .append_user_message(&params.conversation_id, params.user_id, params.content, mentions)
            .await
    }

    #[instrument(skip_all, fields(conversation_id = %id))]
    async fn invoke_agents(
        &self,
        id: &ConversationId,
        target: InvocationTarget,
    ) -> Result<Vec<Message>, EngineError> {
        let permit = self.conversations.begin_invocation(id).await?;
        let trigger = self
            .conversations
            .last_user_message(id)
            .await?
            .ok_or_else(|| EngineError::NoUserMessage(id.clone()))?;
        self.respond(permit, &trigger, target).await
    }

    async fn send_and_respond(&self, params: SendMessage) -> Result<SendOutcome, EngineError> {
        let id = params.conversation_id.clone();
        let message = self.send_message(params).await?;
        let permit = self.conversations.begin_invocation(&id).await?;
        let replies = self.respond(permit, &message, InvocationTarget::Routed).await?;
        Ok(SendOutcome { message, replies })
    }

    async fn update_settings(
        &self,
        id: &ConversationId,
        update: SettingsUpdate,
    ) -> Result<Conversation, EngineError> {
        self.conversations.update_settings(id, update).await
    }

    async fn add_participant(
        &self,
        id: &ConversationId,
        kind: ParticipantKind,
    ) -> Result<Participant, EngineError> {
        if let ParticipantKind::Agent { agent_id } = &kind {
            let conversation = self.conversations.get(id).await?;
            let agent = self.directory.get(agent_id)?;
            if agent.organization_id != conversation.organization_id {
                return Err(EngineError::AgentNotFound(agent_id.clone()));
            }
            if !agent.is_active {
                return Err(EngineError::AgentInactive(agent_id.clone()));
            }
        }
        self.conversations.add_participant(id, kind).await
    }

    async fn remove_participant(
        &self,
        id: &ConversationId,
        participant_id: &ParticipantId,
    ) -> Result<Conversation, EngineError> {
        self.conversations.remove_participant(id, participant_id).await
    }

    async fn archive(&self, id: &ConversationId) -> Result<Conversation, EngineError> {
        self.conversations.archive(id).await
    }
}
