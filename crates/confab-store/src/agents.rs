use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use confab_core::agent::{Agent, AgentKind, ContextScope};
use confab_core::ids::{AgentId, OrganizationId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const AGENT_COLUMNS: &str =
    "id, organization_id, name, kind, context_scopes, is_active, created_at, updated_at";

/// Agent definitions (built-in and custom) per organization.
#[derive(Clone)]
pub struct AgentRepo {
    db: Database,
}

impl AgentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(agent_id = %agent.id, name = %agent.name))]
    pub fn save(&self, agent: &Agent) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO agents (id, organization_id, name, kind, context_scopes, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    context_scopes = excluded.context_scopes,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at",
                params![
                    agent.id.as_str(),
                    agent.organization_id.as_str(),
                    agent.name,
                    serde_json::to_string(&agent.kind)?,
                    serde_json::to_string(&agent.context_scopes)?,
                    agent.is_active,
                    agent.created_at.to_rfc3339(),
                    agent.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &AgentId) -> Result<Option<Agent>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1");
            let raw = conn
                .query_row(&sql, [id.as_str()], RawAgent::from_row)
                .optional()?;
            raw.map(RawAgent::into_agent).transpose()
        })
    }

    /// All agents of an organization, oldest first.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub fn list(&self, organization_id: &OrganizationId) -> Result<Vec<Agent>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE organization_id = ?1
                 ORDER BY created_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([organization_id.as_str()], RawAgent::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawAgent::into_agent).collect()
        })
    }

    /// Returns whether a row was removed.
    #[instrument(skip(self), fields(agent_id = %id))]
    pub fn delete(&self, id: &AgentId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM agents WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }
}

struct RawAgent {
    id: String,
    organization_id: String,
    name: String,
    kind: String,
    context_scopes: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl RawAgent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            kind: row.get(3)?,
            context_scopes: row.get(4)?,
            is_active: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_agent(self) -> Result<Agent, StoreError> {
        const T: &str = "agents";
        let kind: AgentKind = row_helpers::parse_json(&self.kind, T, "kind")?;
        let context_scopes: Vec<ContextScope> =
            row_helpers::parse_json(&self.context_scopes, T, "context_scopes")?;
        Ok(Agent {
            id: AgentId::from_raw(self.id),
            organization_id: OrganizationId::from_raw(self.organization_id),
            name: self.name,
            kind,
            context_scopes,
            is_active: self.is_active,
            created_at: row_helpers::parse_time(&self.created_at, T, "created_at")?,
            updated_at: row_helpers::parse_time(&self.updated_at, T, "updated_at")?,
        })
    }
}
