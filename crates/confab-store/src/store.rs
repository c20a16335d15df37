use confab_core::agent::Agent;
use confab_core::conversation::Conversation;
use confab_core::ids::{AgentId, ConversationId, OrganizationId};
use confab_core::message::Message;

use crate::agents::AgentRepo;
use crate::conversations::ConversationRepo;
use crate::database::Database;
use crate::error::StoreError;

/// Durable backing for the engine's in-memory state.
///
/// Calls are synchronous and short. The engine invokes them while holding
/// a conversation's lock, so a committed mutation is on disk before its
/// event is published.
pub trait ConversationStore: Send + Sync {
    fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Persist `message` together with the conversation state that already
    /// reflects it. Both land or neither does.
    fn append_message(
        &self,
        message: &Message,
        conversation: &Conversation,
    ) -> Result<(), StoreError>;

    fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;

    fn list_conversations(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Conversation>, StoreError>;

    fn load_messages(
        &self,
        id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError>;

    fn save_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, StoreError>;

    fn load_agents(&self, organization_id: &OrganizationId) -> Result<Vec<Agent>, StoreError>;

    fn delete_agent(&self, id: &AgentId) -> Result<bool, StoreError>;
}

/// SQLite implementation over the repos.
#[derive(Clone)]
pub struct SqliteStore {
    conversations: ConversationRepo,
    agents: AgentRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            agents: AgentRepo::new(db),
        }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }
}

impl ConversationStore for SqliteStore {
    fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations.save(conversation)
    }

    fn append_message(
        &self,
        message: &Message,
        conversation: &Conversation,
    ) -> Result<(), StoreError> {
        self.conversations.append_message(message, conversation)
    }

    fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.conversations.get(id)
    }

    fn list_conversations(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.conversations.list(organization_id)
    }

    fn load_messages(
        &self,
        id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        self.conversations.messages(id, limit)
    }

    fn save_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.agents.save(agent)
    }

    fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, StoreError> {
        self.agents.get(id)
    }

    fn load_agents(&self, organization_id: &OrganizationId) -> Result<Vec<Agent>, StoreError> {
        self.agents.list(organization_id)
    }

    fn delete_agent(&self, id: &AgentId) -> Result<bool, StoreError> {
        self.agents.delete(id)
    }
}
