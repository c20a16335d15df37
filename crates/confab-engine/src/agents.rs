//! Organization agent directory.
//!
//! Agents are handed out as `Arc<Agent>` snapshots. An update builds a new
//! record and swaps the `Arc`, so an invocation holding the old snapshot is
//! unaffected.

use std::sync::Arc;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tracing::{info, instrument};

use confab_core::agent::{Agent, AgentKind, ContextScope};
use confab_core::ids::{AgentId, OrganizationId};
use confab_store::ConversationStore;

use crate::error::EngineError;

/// One entry of the built-in specialist catalog.
pub struct BuiltInSpec {
    pub specialist_key: &'static str,
    pub name: &'static str,
    pub base_prompt: &'static str,
    pub scopes: &'static [ContextScope],
}

pub const BUILT_IN_CATALOG: &[BuiltInSpec] = &[
    BuiltInSpec {
        specialist_key: "finance",
        name: "CFO",
        base_prompt: "You are the organization's chief financial officer. Answer with \
                      figures from the organization's resources and processes, and say \
                      plainly when the data does not cover a question.",
        scopes: &[ContextScope::Resources, ContextScope::Processes],
    },
    BuiltInSpec {
        specialist_key: "operations",
        name: "COO",
        base_prompt: "You are the organization's chief operating officer. Ground answers \
                      in how work actually flows through the organization's processes \
                      and functions.",
        scopes: &[
            ContextScope::Processes,
            ContextScope::Functions,
            ContextScope::Resources,
        ],
    },
    BuiltInSpec {
        specialist_key: "people",
        name: "CHRO",
        base_prompt: "You are the organization's chief people officer. Answer questions \
                      about people, roles, and reporting lines from the organization's data.",
        scopes: &[ContextScope::People, ContextScope::Roles],
    },
    BuiltInSpec {
        specialist_key: "strategy",
        name: "Strategy Advisor",
        base_prompt: "You are the organization's strategy advisor. Connect questions to the \
                      organization's canvases, functions, and roles.",
        scopes: &[
            ContextScope::Canvases,
            ContextScope::Functions,
            ContextScope::Roles,
        ],
    },
];

/// Fields for a new custom agent.
#[derive(Clone, Debug)]
pub struct NewCustomAgent {
    pub name: String,
    pub prompt: String,
    pub context_scopes: Vec<ContextScope>,
    pub can_call_built_in_agents: bool,
}

pub struct AgentDirectory {
    store: Arc<dyn ConversationStore>,
    agents: DashMap<AgentId, Arc<Agent>>,
    loaded_orgs: DashSet<OrganizationId>,
}

impl AgentDirectory {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            agents: DashMap::new(),
            loaded_orgs: DashSet::new(),
        }
    }

    /// Provision the built-in catalog for an organization. Keys that already
    /// exist are left alone, so seeding twice is harmless.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub fn seed_builtins(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Arc<Agent>>, EngineError> {
        let mut seeded = Vec::new();
        for spec in BUILT_IN_CATALOG {
            if let Some(existing) = self.find_specialist(organization_id, spec.specialist_key)? {
                seeded.push(existing);
                continue;
            }
            let agent = Agent::built_in(
                organization_id.clone(),
                spec.name,
                spec.specialist_key,
                spec.base_prompt,
                spec.scopes.to_vec(),
            );
            self.store.save_agent(&agent)?;
            info!(agent_id = %agent.id, key = spec.specialist_key, "built-in agent seeded");
            let agent = Arc::new(agent);
            let _ = self.agents.insert(agent.id.clone(), Arc::clone(&agent));
            seeded.push(agent);
        }
        Ok(seeded)
    }

    #[instrument(skip_all, fields(organization_id = %organization_id, name = %spec.name))]
    pub fn create_custom(
        &self,
        organization_id: &OrganizationId,
        spec: NewCustomAgent,
    ) -> Result<Arc<Agent>, EngineError> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidRequest("agent name must not be empty".into()));
        }
        let taken = self
            .list(organization_id)?
            .iter()
            .any(|a| a.name.eq_ignore_ascii_case(name));
        if taken {
            return Err(EngineError::InvalidRequest(format!(
                "an agent named {name} already exists"
            )));
        }

        let agent = Agent::custom(
            organization_id.clone(),
            name,
            spec.prompt,
            spec.context_scopes,
            spec.can_call_built_in_agents,
        );
        self.store.save_agent(&agent)?;
        info!(agent_id = %agent.id, "custom agent created");
        let agent = Arc::new(agent);
        let _ = self.agents.insert(agent.id.clone(), Arc::clone(&agent));
        Ok(agent)
    }

    /// Replace a custom agent's prompt. Built-in prompts are locked.
    pub fn update_custom_prompt(&self, id: &AgentId, prompt: String) -> Result<Arc<Agent>, EngineError> {
        self.update(id, |agent| match &mut agent.kind {
            AgentKind::Custom { prompt: current, .. } => {
                *current = prompt;
                Ok(())
            }
            AgentKind::BuiltIn { .. } => Err(EngineError::InvalidRequest(
                "built-in base prompts are locked; edit custom instructions instead".into(),
            )),
        })
    }

    /// Set the instruction suffix appended to a built-in's base prompt.
    pub fn set_custom_instructions(
        &self,
        id: &AgentId,
        instructions: String,
    ) -> Result<Arc<Agent>, EngineError> {
        self.update(id, |agent| match &mut agent.kind {
            AgentKind::BuiltIn {
                custom_instructions,
                ..
            } => {
                *custom_instructions = instructions;
                Ok(())
            }
            AgentKind::Custom { .. } => Err(EngineError::InvalidRequest(
                "custom agents have no instruction suffix; edit the prompt".into(),
            )),
        })
    }

    pub fn set_scopes(&self, id: &AgentId, scopes: Vec<ContextScope>) -> Result<Arc<Agent>, EngineError> {
        self.update(id, |agent| {
            agent.context_scopes = scopes;
            Ok(())
        })
    }

    pub fn set_active(&self, id: &AgentId, active: bool) -> Result<Arc<Agent>, EngineError> {
        self.update(id, |agent| {
            agent.is_active = active;
            Ok(())
        })
    }

    /// Delete a custom agent. Built-ins can only be deactivated.
    #[instrument(skip(self), fields(agent_id = %id))]
    pub fn delete(&self, id: &AgentId) -> Result<(), EngineError> {
        let agent = self.get(id)?;
        if agent.is_built_in() {
            return Err(EngineError::CannotDeleteBuiltIn(id.clone()));
        }
        let _ = self.store.delete_agent(id)?;
        let _ = self.agents.remove(id);
        info!(agent_id = %id, "custom agent deleted");
        Ok(())
    }

    /// Current snapshot of an agent, active or not.
    pub fn get(&self, id: &AgentId) -> Result<Arc<Agent>, EngineError> {
        if let Some(agent) = self.agents.get(id) {
            return Ok(Arc::clone(agent.value()));
        }
        let agent = self
            .store
            .load_agent(id)?
            .ok_or_else(|| EngineError::AgentNotFound(id.clone()))?;
        let agent = Arc::new(agent);
        let _ = self.agents.insert(id.clone(), Arc::clone(&agent));
        Ok(agent)
    }

    /// Snapshot that must be active to be invoked.
    pub fn get_active(&self, id: &AgentId) -> Result<Arc<Agent>, EngineError> {
        let agent = self.get(id)?;
        if !agent.is_active {
            return Err(EngineError::AgentInactive(id.clone()));
        }
        Ok(agent)
    }

    /// All agents of an organization, oldest first.
    pub fn list(&self, organization_id: &OrganizationId) -> Result<Vec<Arc<Agent>>, EngineError> {
        self.ensure_loaded(organization_id)?;
        let mut agents: Vec<Arc<Agent>> = self
            .agents
            .iter()
            .filter(|entry| &entry.value().organization_id == organization_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(agents)
    }

    /// The built-in agent registered under `key`, active or not.
    pub fn find_specialist(
        &self,
        organization_id: &OrganizationId,
        key: &str,
    ) -> Result<Option<Arc<Agent>>, EngineError> {
        Ok(self
            .list(organization_id)?
            .into_iter()
            .find(|a| a.specialist_key() == Some(key)))
    }

    /// Keys of specialists a delegating agent may consult right now.
    pub fn available_specialists(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self
            .list(organization_id)?
            .iter()
            .filter(|a| a.is_active && a.can_be_orchestrated())
            .filter_map(|a| a.specialist_key().map(str::to_string))
            .collect())
    }

    fn ensure_loaded(&self, organization_id: &OrganizationId) -> Result<(), EngineError> {
        if self.loaded_orgs.contains(organization_id) {
            return Ok(());
        }
        for agent in self.store.load_agents(organization_id)? {
            let _ = self
                .agents
                .entry(agent.id.clone())
                .or_insert_with(|| Arc::new(agent));
        }
        let _ = self.loaded_orgs.insert(organization_id.clone());
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then swap the snapshot. The
    /// map entry stays locked throughout so concurrent edits serialize.
    fn update<F>(&self, id: &AgentId, change: F) -> Result<Arc<Agent>, EngineError>
    where
        F: FnOnce(&mut Agent) -> Result<(), EngineError>,
    {
        let _ = self.get(id)?;
        let mut entry = self
            .agents
            .get_mut(id)
            .ok_or_else(|| EngineError::AgentNotFound(id.clone()))?;

        let mut updated = Agent::clone(entry.value());
        change(&mut updated)?;
        updated.updated_at = Utc::now();
        self.store.save_agent(&updated)?;

        let updated = Arc::new(updated);
        *entry.value_mut() = Arc::clone(&updated);
        info!(agent_id = %id, active = updated.is_active, "agent updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_store::SqliteStore;

    fn org() -> OrganizationId {
        OrganizationId::from_raw("org_1")
    }

    fn directory() -> (AgentDirectory, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        (AgentDirectory::new(store.clone()), store)
    }

    fn coach() -> NewCustomAgent {
        NewCustomAgent {
            name: "Coach".into(),
            prompt: "Be encouraging.".into(),
            context_scopes: vec![ContextScope::People],
            can_call_built_in_agents: true,
        }
    }

    #[test]
    fn seeding_is_idempotent() {
        let (dir, store) = directory();
        let first = dir.seed_builtins(&org()).unwrap();
        let second = dir.seed_builtins(&org()).unwrap();
        assert_eq!(first.len(), BUILT_IN_CATALOG.len());
        let ids: Vec<_> = first.iter().map(|a| a.id.clone()).collect();
        let again: Vec<_> = second.iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, again);
        assert_eq!(store.load_agents(&org()).unwrap().len(), BUILT_IN_CATALOG.len());
    }

    #[test]
    fn specialist_lookup() {
        let (dir, _) = directory();
        dir.seed_builtins(&org()).unwrap();
        let cfo = dir.find_specialist(&org(), "finance").unwrap().unwrap();
        assert_eq!(cfo.name, "CFO");
        assert!(dir.find_specialist(&org(), "legal").unwrap().is_none());
        assert!(dir
            .find_specialist(&OrganizationId::from_raw("org_2"), "finance")
            .unwrap()
            .is_none());
    }

    #[test]
    fn built_ins_cannot_be_deleted() {
        let (dir, _) = directory();
        let seeded = dir.seed_builtins(&org()).unwrap();
        let err = dir.delete(&seeded[0].id).unwrap_err();
        assert!(matches!(err, EngineError::CannotDeleteBuiltIn(_)));
    }

    #[test]
    fn custom_agents_can_be_deleted() {
        let (dir, store) = directory();
        let agent = dir.create_custom(&org(), coach()).unwrap();
        dir.delete(&agent.id).unwrap();
        assert!(matches!(dir.get(&agent.id), Err(EngineError::AgentNotFound(_))));
        assert!(store.load_agent(&agent.id).unwrap().is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let (dir, _) = directory();
        dir.create_custom(&org(), coach()).unwrap();
        let mut twin = coach();
        twin.name = "coach".into();
        assert!(matches!(
            dir.create_custom(&org(), twin),
            Err(EngineError::InvalidRequest(_))
        ));
        let mut blank = coach();
        blank.name = "   ".into();
        assert!(dir.create_custom(&org(), blank).is_err());
    }

    #[test]
    fn instructions_only_for_built_ins() {
        let (dir, _) = directory();
        dir.seed_builtins(&org()).unwrap();
        let cfo = dir.find_specialist(&org(), "finance").unwrap().unwrap();
        let updated = dir
            .set_custom_instructions(&cfo.id, "Report in euros.".into())
            .unwrap();
        assert!(updated.effective_prompt().ends_with("Report in euros."));
        assert!(dir.update_custom_prompt(&cfo.id, "new".into()).is_err());

        let custom = dir.create_custom(&org(), coach()).unwrap();
        assert!(dir.set_custom_instructions(&custom.id, "x".into()).is_err());
        let edited = dir.update_custom_prompt(&custom.id, "Be blunt.".into()).unwrap();
        assert_eq!(edited.effective_prompt(), "Be blunt.");
    }

    #[test]
    fn snapshots_survive_updates() {
        let (dir, _) = directory();
        let agent = dir.create_custom(&org(), coach()).unwrap();
        let snapshot = dir.get(&agent.id).unwrap();
        dir.set_active(&agent.id, false).unwrap();

        assert!(snapshot.is_active);
        assert!(!dir.get(&agent.id).unwrap().is_active);
        assert!(matches!(
            dir.get_active(&agent.id),
            Err(EngineError::AgentInactive(_))
        ));
    }

    #[test]
    fn available_specialists_excludes_inactive() {
        let (dir, _) = directory();
        dir.seed_builtins(&org()).unwrap();
        let people = dir.find_specialist(&org(), "people").unwrap().unwrap();
        dir.set_active(&people.id, false).unwrap();
        let keys = dir.available_specialists(&org()).unwrap();
        assert!(keys.contains(&"finance".to_string()));
        assert!(!keys.contains(&"people".to_string()));
    }

    #[test]
    fn directory_reloads_from_store() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let first = AgentDirectory::new(store.clone());
        first.seed_builtins(&org()).unwrap();
        let custom = first.create_custom(&org(), coach()).unwrap();

        let second = AgentDirectory::new(store);
        assert_eq!(second.list(&org()).unwrap().len(), BUILT_IN_CATALOG.len() + 1);
        assert_eq!(second.get(&custom.id).unwrap().name, "Coach");
    }
}
