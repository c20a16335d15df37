//! Authoritative conversation state.
//!
//! Each conversation lives behind its own async mutex. Every mutation runs
//! inside that critical section: validate, persist through the store,
//! commit to memory, then publish an [`EngineEvent`]. Publishing under the
//! lock keeps event order identical to commit order per conversation.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument};

use confab_core::conversation::{
    Conversation, ConversationMode, ConversationStatus, Participant, ParticipantKind,
    ParticipantRole,
};
use confab_core::events::EngineEvent;
use confab_core::ids::{AgentId, ConversationId, OrganizationId, ParticipantId, UserId};
use confab_core::message::{Message, Sender};
use confab_store::ConversationStore;

use crate::error::EngineError;

struct ConversationEntry {
    conversation: Conversation,
    /// Most recent human-authored message; the trigger for routed invocations.
    last_user_message: Option<Message>,
}

/// Proof that an invocation was admitted while the conversation was open.
///
/// Replies recorded with a permit are appended even if the conversation is
/// paused before they complete.
#[derive(Clone, Debug)]
pub struct InvocationPermit {
    conversation: Conversation,
}

impl InvocationPermit {
    /// Conversation state at admission time.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation.id
    }
}

/// Requested settings change. `None` leaves a field as is.
#[derive(Clone, Copy, Debug, Default)]
pub struct SettingsUpdate {
    pub mode: Option<ConversationMode>,
    pub status: Option<ConversationStatus>,
}

pub struct ConversationManager {
    store: Arc<dyn ConversationStore>,
    entries: DashMap<ConversationId, Arc<Mutex<ConversationEntry>>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn ConversationStore>, event_tx: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    #[instrument(skip_all, fields(organization_id = %organization_id, owner = %owner))]
    pub fn create_conversation(
        &self,
        organization_id: OrganizationId,
        owner: UserId,
        title: impl Into<String>,
        mode: ConversationMode,
    ) -> Result<Conversation, EngineError> {
        let conversation = Conversation::new(organization_id, owner, title, mode);
        self.store.save_conversation(&conversation)?;
        let _ = self.entries.insert(
            conversation.id.clone(),
            Arc::new(Mutex::new(ConversationEntry {
                conversation: conversation.clone(),
                last_user_message: None,
            })),
        );
        info!(conversation_id = %conversation.id, %mode, "conversation created");
        Ok(conversation)
    }

    /// Snapshot of the current state.
    pub async fn get(&self, id: &ConversationId) -> Result<Conversation, EngineError> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Ok(guard.conversation.clone())
    }

    pub fn list(&self, organization_id: &OrganizationId) -> Result<Vec<Conversation>, EngineError> {
        Ok(self.store.list_conversations(organization_id)?)
    }

    /// Messages oldest first; with `limit`, only the most recent ones.
    pub async fn messages(
        &self,
        id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, EngineError> {
        let _ = self.entry(id)?;
        Ok(self.store.load_messages(id, limit)?)
    }

    pub async fn last_user_message(&self, id: &ConversationId) -> Result<Option<Message>, EngineError> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Ok(guard.last_user_message.clone())
    }

    /// Append a human message. Rejected while paused or archived.
    #[instrument(skip_all, fields(conversation_id = %id, user_id = %user_id))]
    pub async fn append_user_message(
        &self,
        id: &ConversationId,
        user_id: UserId,
        content: impl Into<String>,
        mentions: Vec<AgentId>,
    ) -> Result<Message, EngineError> {
        let message = Message::from_user(id.clone(), user_id, content, mentions);
        self.append(id, message, true).await
    }

    /// Append a fully formed message of either sender kind, subject to the
    /// pause check.
    pub async fn append_message(&self, message: Message) -> Result<Message, EngineError> {
        let id = message.conversation_id.clone();
        self.append(&id, message, true).await
    }

    /// Admit an agent invocation. Fails while paused or archived.
    pub async fn begin_invocation(&self, id: &ConversationId) -> Result<InvocationPermit, EngineError> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        ensure_writable(&guard.conversation, true)?;
        Ok(InvocationPermit {
            conversation: guard.conversation.clone(),
        })
    }

    /// Append the reply of an admitted invocation. Only archiving blocks it.
    pub async fn record_reply(
        &self,
        permit: &InvocationPermit,
        message: Message,
    ) -> Result<Message, EngineError> {
        if message.conversation_id != permit.conversation.id || !message.sender.is_ai() {
            return Err(EngineError::InvalidRequest(
                "a permit only covers agent replies in its own conversation".into(),
            ));
        }
        self.append(&permit.conversation.id, message, false).await
    }

    async fn append(
        &self,
        id: &ConversationId,
        message: Message,
        check_pause: bool,
    ) -> Result<Message, EngineError> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        ensure_writable(&guard.conversation, check_pause)?;

        let mut updated = guard.conversation.clone();
        apply_message(&mut updated, &message);
        self.store.append_message(&message, &updated)?;

        guard.conversation = updated;
        if !message.sender.is_ai() {
            guard.last_user_message = Some(message.clone());
        }
        debug!(
            conversation_id = %id,
            message_id = %message.id,
            status = %message.status,
            count = guard.conversation.stats.message_count,
            "message appended"
        );
        let _ = self.event_tx.send(EngineEvent::MessageAppended {
            conversation_id: id.clone(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Change mode and/or status. A request that changes nothing (pausing
    /// a paused conversation) writes nothing and publishes nothing.
    #[instrument(skip_all, fields(conversation_id = %id))]
    pub async fn update_settings(
        &self,
        id: &ConversationId,
        update: SettingsUpdate,
    ) -> Result<Conversation, EngineError> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        ensure_writable(&guard.conversation, false)?;

        let mut updated = guard.conversation.clone();
        if let Some(mode) = update.mode {
            updated.mode = mode;
        }
        if let Some(status) = update.status {
            updated.status = status;
        }
        if updated.mode == guard.conversation.mode && updated.status == guard.conversation.status {
            return Ok(updated);
        }

        self.store.save_conversation(&updated)?;
        guard.conversation = updated.clone();
        info!(conversation_id = %id, mode = %updated.mode, status = %updated.status, "settings updated");
        let _ = self.event_tx.send(EngineEvent::SettingsUpdated {
            conversation_id: id.clone(),
            mode: updated.mode,
            status: updated.status,
        });
        Ok(updated)
    }

    /// Add a human or agent participant. Agent validity (existence,
    /// organization, active flag) is the caller's concern.
    #[instrument(skip_all, fields(conversation_id = %id))]
    pub async fn add_participant(
        &self,
        id: &ConversationId,
        kind: ParticipantKind,
    ) -> Result<Participant, EngineError> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        ensure_writable(&guard.conversation, false)?;

        let duplicate = match &kind {
            ParticipantKind::Agent { agent_id } => guard.conversation.has_agent(agent_id),
            ParticipantKind::Human { user_id } => guard.conversation.has_user(user_id),
        };
        if duplicate {
            return Err(EngineError::DuplicateParticipant(match &kind {
                ParticipantKind::Agent { agent_id } => agent_id.to_string(),
                ParticipantKind::Human { user_id } => user_id.to_string(),
            }));
        }

        let participant = match kind {
            ParticipantKind::Agent { agent_id } => Participant::agent(agent_id),
            ParticipantKind::Human { user_id } => Participant::human(user_id, ParticipantRole::Member),
        };
        let mut updated = guard.conversation.clone();
        updated.participants.push(participant.clone());
        self.store.save_conversation(&updated)?;
        guard.conversation = updated;

        info!(conversation_id = %id, participant_id = %participant.id, "participant added");
        let _ = self.event_tx.send(EngineEvent::ParticipantAdded {
            conversation_id: id.clone(),
            participant: participant.clone(),
        });
        Ok(participant)
    }

    /// Soft-remove a participant; the record stays with `removed_at` set.
    #[instrument(skip_all, fields(conversation_id = %id, participant_id = %participant_id))]
    pub async fn remove_participant(
        &self,
        id: &ConversationId,
        participant_id: &ParticipantId,
    ) -> Result<Conversation, EngineError> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        ensure_writable(&guard.conversation, false)?;

        let mut updated = guard.conversation.clone();
        let participant = updated
            .participants
            .iter_mut()
            .find(|p| &p.id == participant_id && p.is_present())
            .ok_or_else(|| EngineError::ParticipantNotFound(participant_id.clone()))?;
        if participant.role == ParticipantRole::Owner {
            return Err(EngineError::CannotRemoveOwner);
        }
        participant.removed_at = Some(Utc::now());

        self.store.save_conversation(&updated)?;
        guard.conversation = updated.clone();
        info!(conversation_id = %id, participant_id = %participant_id, "participant removed");
        let _ = self.event_tx.send(EngineEvent::ParticipantRemoved {
            conversation_id: id.clone(),
            participant_id: participant_id.clone(),
        });
        Ok(updated)
    }

    /// Make the conversation read-only. Archiving twice is a no-op.
    #[instrument(skip_all, fields(conversation_id = %id))]
    pub async fn archive(&self, id: &ConversationId) -> Result<Conversation, EngineError> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        if guard.conversation.is_archived() {
            return Ok(guard.conversation.clone());
        }

        let archived_at = Utc::now();
        let mut updated = guard.conversation.clone();
        updated.archived_at = Some(archived_at);
        self.store.save_conversation(&updated)?;
        guard.conversation = updated.clone();

        info!(conversation_id = %id, "conversation archived");
        let _ = self.event_tx.send(EngineEvent::ConversationArchived {
            conversation_id: id.clone(),
            archived_at,
        });
        Ok(updated)
    }

    /// The in-memory entry, rehydrating from the store on first use.
    fn entry(&self, id: &ConversationId) -> Result<Arc<Mutex<ConversationEntry>>, EngineError> {
        if let Some(entry) = self.entries.get(id) {
            return Ok(Arc::clone(entry.value()));
        }

        let conversation = self
            .store
            .load_conversation(id)?
            .ok_or_else(|| EngineError::ConversationNotFound(id.clone()))?;
        let last_user_message = self
            .store
            .load_messages(id, None)?
            .into_iter()
            .rev()
            .find(|m| matches!(m.sender, Sender::User { .. }));
        debug!(conversation_id = %id, "conversation rehydrated from store");

        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationEntry {
                    conversation,
                    last_user_message,
                }))
            });
        Ok(Arc::clone(entry.value()))
    }
}

fn ensure_writable(conversation: &Conversation, check_pause: bool) -> Result<(), EngineError> {
    if conversation.is_archived() {
        return Err(EngineError::ConversationArchived(conversation.id.clone()));
    }
    if check_pause && conversation.is_paused() {
        return Err(EngineError::ConversationPaused(conversation.id.clone()));
    }
    Ok(())
}

/// Fold one appended message into the conversation aggregates.
fn apply_message(conversation: &mut Conversation, message: &Message) {
    let stats = &mut conversation.stats;
    stats.message_count += 1;
    stats.last_message_at = Some(message.created_at);
    if let Some(agent_id) = message.sender.agent_id() {
        if message.is_sent() {
            stats.ai_response_count += 1;
        }
        stats.total_tokens += message.tokens();
        stats.total_cost += message.cost();
        conversation.last_responder = Some(agent_id.clone());
    }
}
