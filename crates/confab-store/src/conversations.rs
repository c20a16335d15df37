use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use confab_core::conversation::{Conversation, ConversationStats, Participant};
use confab_core::ids::{AgentId, ConversationId, MessageId, OrganizationId};
use confab_core::message::{AiUsage, Message, Sender};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const CONVERSATION_COLUMNS: &str = "id, organization_id, title, mode, status, participants, \
     last_responder, message_count, ai_response_count, total_tokens, total_cost, \
     last_message_at, started_at, archived_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender, content, status, mentions, usage, created_at";

/// Conversations and their message log.
#[derive(Clone)]
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the conversation row.
    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    pub fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.db.with_conn(|conn| upsert_conversation(conn, conversation))
    }

    /// Append a message and write the conversation's updated aggregates in
    /// one transaction, so the stored counters never drift from the log.
    #[instrument(skip_all, fields(conversation_id = %conversation.id, message_id = %message.id))]
    pub fn append_message(
        &self,
        message: &Message,
        conversation: &Conversation,
    ) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            upsert_conversation(conn, conversation)?;
            let usage = message
                .usage
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let _ = conn.execute(
                "INSERT INTO messages (id, conversation_id, sender, content, status, mentions, usage, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id.as_str(),
                    message.conversation_id.as_str(),
                    serde_json::to_string(&message.sender)?,
                    message.content,
                    message.status.to_string(),
                    serde_json::to_string(&message.mentions)?,
                    usage,
                    message.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
            let raw = conn
                .query_row(&sql, [id.as_str()], RawConversation::from_row)
                .optional()?;
            raw.map(RawConversation::into_conversation).transpose()
        })
    }

    pub fn list(&self, organization_id: &OrganizationId) -> Result<Vec<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE organization_id = ?1 ORDER BY started_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([organization_id.as_str()], RawConversation::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(RawConversation::into_conversation)
                .collect()
        })
    }

    /// Messages in append order. With `limit`, only the most recent `limit`
    /// messages, still oldest first.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn messages(
        &self,
        id: &ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                    SELECT seq, {MESSAGE_COLUMNS} FROM messages
                    WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2
                 ) ORDER BY seq ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![id.as_str(), limit], RawMessage::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawMessage::into_message).collect()
        })
    }
}

fn upsert_conversation(conn: &Connection, c: &Conversation) -> Result<(), StoreError> {
    let _ = conn.execute(
        "INSERT INTO conversations (id, organization_id, title, mode, status, participants,
            last_responder, message_count, ai_response_count, total_tokens, total_cost,
            last_message_at, started_at, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            mode = excluded.mode,
            status = excluded.status,
            participants = excluded.participants,
            last_responder = excluded.last_responder,
            message_count = excluded.message_count,
            ai_response_count = excluded.ai_response_count,
            total_tokens = excluded.total_tokens,
            total_cost = excluded.total_cost,
            last_message_at = excluded.last_message_at,
            archived_at = excluded.archived_at",
        params![
            c.id.as_str(),
            c.organization_id.as_str(),
            c.title,
            c.mode.as_str(),
            c.status.to_string(),
            serde_json::to_string(&c.participants)?,
            c.last_responder.as_ref().map(AgentId::as_str),
            c.stats.message_count as i64,
            c.stats.ai_response_count as i64,
            c.stats.total_tokens as i64,
            c.stats.total_cost,
            c.stats.last_message_at.map(|t| t.to_rfc3339()),
            c.started_at.to_rfc3339(),
            c.archived_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Column values as stored, decoded into domain types afterwards so decode
/// failures surface as `CorruptRow` rather than a generic SQLite error.
struct RawConversation {
    id: String,
    organization_id: String,
    title: String,
    mode: String,
    status: String,
    participants: String,
    last_responder: Option<String>,
    message_count: i64,
    ai_response_count: i64,
    total_tokens: i64,
    total_cost: f64,
    last_message_at: Option<String>,
    started_at: String,
    archived_at: Option<String>,
}

impl RawConversation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            title: row.get(2)?,
            mode: row.get(3)?,
            status: row.get(4)?,
            participants: row.get(5)?,
            last_responder: row.get(6)?,
            message_count: row.get(7)?,
            ai_response_count: row.get(8)?,
            total_tokens: row.get(9)?,
            total_cost: row.get(10)?,
            last_message_at: row.get(11)?,
            started_at: row.get(12)?,
            archived_at: row.get(13)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, StoreError> {
        const T: &str = "conversations";
        let participants: Vec<Participant> =
            row_helpers::parse_json(&self.participants, T, "participants")?;
        Ok(Conversation {
            id: ConversationId::from_raw(self.id),
            organization_id: OrganizationId::from_raw(self.organization_id),
            title: self.title,
            mode: row_helpers::parse_enum(&self.mode, T, "mode")?,
            status: row_helpers::parse_enum(&self.status, T, "status")?,
            participants,
            stats: ConversationStats {
                message_count: self.message_count.max(0) as u64,
                ai_response_count: self.ai_response_count.max(0) as u64,
                total_tokens: self.total_tokens.max(0) as u64,
                total_cost: self.total_cost,
                last_message_at: row_helpers::parse_time_opt(
                    self.last_message_at,
                    T,
                    "last_message_at",
                )?,
            },
            last_responder: self.last_responder.map(AgentId::from_raw),
            started_at: row_helpers::parse_time(&self.started_at, T, "started_at")?,
            archived_at: row_helpers::parse_time_opt(self.archived_at, T, "archived_at")?,
        })
    }
}

struct RawMessage {
    id: String,
    conversation_id: String,
    sender: String,
    content: String,
    status: String,
    mentions: String,
    usage: Option<String>,
    created_at: String,
}

impl RawMessage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender: row.get(2)?,
            content: row.get(3)?,
            status: row.get(4)?,
            mentions: row.get(5)?,
            usage: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_message(self) -> Result<Message, StoreError> {
        const T: &str = "messages";
        let sender: Sender = row_helpers::parse_json(&self.sender, T, "sender")?;
        let mentions: Vec<AgentId> = row_helpers::parse_json(&self.mentions, T, "mentions")?;
        let usage: Option<AiUsage> = self
            .usage
            .as_deref()
            .map(|raw| row_helpers::parse_json(raw, T, "usage"))
            .transpose()?;
        Ok(Message {
            id: MessageId::from_raw(self.id),
            conversation_id: ConversationId::from_raw(self.conversation_id),
            sender,
            content: self.content,
            status: row_helpers::parse_enum(&self.status, T, "status")?,
            mentions,
            usage,
            created_at: row_helpers::parse_time(&self.created_at, T, "created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::conversation::{ConversationMode, ConversationStatus};
    use confab_core::ids::UserId;
    use confab_core::message::MessageStatus;

    fn setup() -> (ConversationRepo, Conversation) {
        let db = Database::in_memory().unwrap();
        let repo = ConversationRepo::new(db);
        let conv = Conversation::new(
            OrganizationId::from_raw("org_1"),
            UserId::from_raw("user_1"),
            "Quarterly planning",
            ConversationMode::OnDemand,
        );
        repo.save(&conv).unwrap();
        (repo, conv)
    }

    fn user_msg(conv: &Conversation, text: &str) -> Message {
        Message::from_user(conv.id.clone(), UserId::from_raw("user_1"), text, vec![])
    }

    #[test]
    fn save_and_get() {
        let (repo, conv) = setup();
        let loaded = repo.get(&conv.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Quarterly planning");
        assert_eq!(loaded.mode, ConversationMode::OnDemand);
        assert_eq!(loaded.participants.len(), 1);
        assert_eq!(loaded.started_at, conv.started_at);
    }

    #[test]
    fn get_missing_returns_none() {
        let (repo, _) = setup();
        assert!(repo.get(&ConversationId::new()).unwrap().is_none());
    }

    #[test]
    fn save_overwrites_settings() {
        let (repo, mut conv) = setup();
        conv.mode = ConversationMode::Free;
        conv.status = ConversationStatus::Paused;
        conv.participants.push(Participant::agent(AgentId::from_raw("agent_cfo")));
        repo.save(&conv).unwrap();

        let loaded = repo.get(&conv.id).unwrap().unwrap();
        assert_eq!(loaded.mode, ConversationMode::Free);
        assert!(loaded.is_paused());
        assert_eq!(loaded.agent_participants(), vec![AgentId::from_raw("agent_cfo")]);
    }

    #[test]
    fn append_updates_aggregates_together() {
        let (repo, mut conv) = setup();
        let msg = Message::from_agent(
            conv.id.clone(),
            AgentId::from_raw("agent_cfo"),
            "Budget is fine.",
            MessageStatus::Sent,
            AiUsage {
                tokens: 120,
                response_time_ms: 900,
                cost: 0.002,
                ..Default::default()
            },
        );
        conv.stats.message_count = 1;
        conv.stats.ai_response_count = 1;
        conv.stats.total_tokens = 120;
        conv.stats.total_cost = 0.002;
        conv.stats.last_message_at = Some(msg.created_at);
        conv.last_responder = Some(AgentId::from_raw("agent_cfo"));
        repo.append_message(&msg, &conv).unwrap();

        let loaded = repo.get(&conv.id).unwrap().unwrap();
        assert_eq!(loaded.stats.message_count, 1);
        assert_eq!(loaded.stats.total_tokens, 120);
        assert_eq!(loaded.last_responder, Some(AgentId::from_raw("agent_cfo")));

        let msgs = repo.messages(&conv.id, None).unwrap();
        assert_eq!(msgs, vec![msg]);
    }

    #[test]
    fn messages_keep_append_order() {
        let (repo, conv) = setup();
        for text in ["one", "two", "three"] {
            repo.append_message(&user_msg(&conv, text), &conv).unwrap();
        }
        let all: Vec<String> = repo
            .messages(&conv.id, None)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(all, vec!["one", "two", "three"]);
    }

    #[test]
    fn messages_limit_takes_most_recent() {
        let (repo, conv) = setup();
        for text in ["one", "two", "three", "four"] {
            repo.append_message(&user_msg(&conv, text), &conv).unwrap();
        }
        let recent: Vec<String> = repo
            .messages(&conv.id, Some(2))
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(recent, vec!["three", "four"]);
    }

    #[test]
    fn duplicate_message_id_rolls_back() {
        let (repo, mut conv) = setup();
        let msg = user_msg(&conv, "hello");
        repo.append_message(&msg, &conv).unwrap();

        conv.stats.message_count = 99;
        assert!(repo.append_message(&msg, &conv).is_err());
        let loaded = repo.get(&conv.id).unwrap().unwrap();
        assert_eq!(loaded.stats.message_count, 0);
    }

    #[test]
    fn list_by_organization() {
        let (repo, conv) = setup();
        let other = Conversation::new(
            OrganizationId::from_raw("org_2"),
            UserId::from_raw("user_9"),
            "Elsewhere",
            ConversationMode::Free,
        );
        repo.save(&other).unwrap();
        let listed = repo.list(&conv.organization_id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, conv.id);
    }

    #[test]
    fn corrupt_mode_is_reported() {
        let (repo, conv) = setup();
        repo.db
            .with_conn(|c| {
                c.execute(
                    "UPDATE conversations SET mode = 'shouting' WHERE id = ?1",
                    [conv.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();
        let err = repo.get(&conv.id).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "mode", .. }));
    }
}
