use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, OrganizationId};

/// Named data domain an agent is allowed to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    People,
    Roles,
    Functions,
    Processes,
    Resources,
    Canvases,
}

impl ContextScope {
    pub const ALL: [ContextScope; 6] = [
        Self::People,
        Self::Roles,
        Self::Functions,
        Self::Processes,
        Self::Resources,
        Self::Canvases,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::People => "people",
            Self::Roles => "roles",
            Self::Functions => "functions",
            Self::Processes => "processes",
            Self::Resources => "resources",
            Self::Canvases => "canvases",
        }
    }
}

impl std::fmt::Display for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContextScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| format!("unknown context scope: {s}"))
    }
}

/// The two agent classes and the fields only meaningful to each.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agent_type", rename_all = "snake_case")]
pub enum AgentKind {
    /// Provisioned by organization seeding. `base_prompt` is locked; only
    /// `custom_instructions` can be edited.
    BuiltIn {
        specialist_key: String,
        base_prompt: String,
        #[serde(default)]
        custom_instructions: String,
        can_be_orchestrated: bool,
    },
    /// User-authored persona with a fully editable prompt.
    Custom {
        prompt: String,
        can_call_built_in_agents: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub kind: AgentKind,
    pub context_scopes: Vec<ContextScope>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn built_in(
        organization_id: OrganizationId,
        name: impl Into<String>,
        specialist_key: impl Into<String>,
        base_prompt: impl Into<String>,
        context_scopes: Vec<ContextScope>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            organization_id,
            name: name.into(),
            kind: AgentKind::BuiltIn {
                specialist_key: specialist_key.into(),
                base_prompt: base_prompt.into(),
                custom_instructions: String::new(),
                can_be_orchestrated: true,
            },
            context_scopes,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn custom(
        organization_id: OrganizationId,
        name: impl Into<String>,
        prompt: impl Into<String>,
        context_scopes: Vec<ContextScope>,
        can_call_built_in_agents: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            organization_id,
            name: name.into(),
            kind: AgentKind::Custom {
                prompt: prompt.into(),
                can_call_built_in_agents,
            },
            context_scopes,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_built_in(&self) -> bool {
        matches!(self.kind, AgentKind::BuiltIn { .. })
    }

    pub fn specialist_key(&self) -> Option<&str> {
        match &self.kind {
            AgentKind::BuiltIn { specialist_key, .. } => Some(specialist_key),
            AgentKind::Custom { .. } => None,
        }
    }

    /// Only Custom agents can delegate.
    pub fn can_delegate(&self) -> bool {
        matches!(
            self.kind,
            AgentKind::Custom {
                can_call_built_in_agents: true,
                ..
            }
        )
    }

    /// Only BuiltIn agents can be delegated to.
    pub fn can_be_orchestrated(&self) -> bool {
        matches!(
            self.kind,
            AgentKind::BuiltIn {
                can_be_orchestrated: true,
                ..
            }
        )
    }

    /// Prompt actually sent to the generator.
    pub fn effective_prompt(&self) -> String {
        match &self.kind {
            AgentKind::BuiltIn {
                base_prompt,
                custom_instructions,
                ..
            } => {
                if custom_instructions.trim().is_empty() {
                    base_prompt.clone()
                } else {
                    format!("{base_prompt}\n\n{custom_instructions}")
                }
            }
            AgentKind::Custom { prompt, .. } => prompt.clone(),
        }
    }
}
