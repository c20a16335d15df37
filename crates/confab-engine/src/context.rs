//! Scoped context resolution.
//!
//! Each [`ContextScope`] is served by exactly one [`ContextLoader`]. An agent's
//! scopes are resolved concurrently and returned in the agent's declared order.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use confab_core::agent::ContextScope;
use confab_core::errors::ContextError;
use confab_core::ids::OrganizationId;
use confab_core::provider::{ContextBlock, ContextLoader};

/// Registry of one loader per scope.
#[derive(Clone, Default)]
pub struct ContextSources {
    loaders: HashMap<ContextScope, Arc<dyn ContextLoader>>,
}

impl ContextSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `loader` for `scope`, replacing any previous one.
    pub fn with(mut self, scope: ContextScope, loader: Arc<dyn ContextLoader>) -> Self {
        let _ = self.loaders.insert(scope, loader);
        self
    }

    /// Serve every scope from the same loader.
    pub fn uniform(loader: Arc<dyn ContextLoader>) -> Self {
        ContextScope::ALL
            .into_iter()
            .fold(Self::new(), |sources, scope| sources.with(scope, Arc::clone(&loader)))
    }

    pub fn has_loader(&self, scope: ContextScope) -> bool {
        self.loaders.contains_key(&scope)
    }

    /// Load every scope for `organization_id`. The first failure wins.
    pub async fn resolve(
        &self,
        scopes: &[ContextScope],
        organization_id: &OrganizationId,
    ) -> Result<Vec<ContextBlock>, ContextError> {
        let loads = scopes.iter().map(|&scope| async move {
            let loader = self
                .loaders
                .get(&scope)
                .ok_or(ContextError::NoLoader(scope))?;
            let data = loader.load(scope, organization_id).await?;
            Ok::<_, ContextError>(ContextBlock::scope(scope, data))
        });
        let blocks = try_join_all(loads).await?;
        debug!(organization_id = %organization_id, scopes = blocks.len(), "context resolved");
        Ok(blocks)
    }
}

/// In-memory loader. Unset scopes load as an empty array.
#[derive(Default)]
pub struct StaticContextLoader {
    data: RwLock<HashMap<(OrganizationId, ContextScope), Value>>,
}

impl StaticContextLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, organization_id: &OrganizationId, scope: ContextScope, data: Value) {
        let _ = self.data.write().insert((organization_id.clone(), scope), data);
    }
}

#[async_trait]
impl ContextLoader for StaticContextLoader {
    async fn load(
        &self,
        scope: ContextScope,
        organization_id: &OrganizationId,
    ) -> Result<Value, ContextError> {
        Ok(self
            .data
            .read()
            .get(&(organization_id.clone(), scope))
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }
}

/// Reads `<root>/<organization_id>/<scope>.json`. A missing file is empty data.
pub struct JsonFileContextLoader {
    root: PathBuf,
}

impl JsonFileContextLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, scope: ContextScope, organization_id: &OrganizationId) -> PathBuf {
        self.root
            .join(organization_id.as_str())
            .join(format!("{}.json", scope.as_str()))
    }
}

#[async_trait]
impl ContextLoader for JsonFileContextLoader {
    async fn load(
        &self,
        scope: ContextScope,
        organization_id: &OrganizationId,
    ) -> Result<Value, ContextError> {
        let path = self.path_for(scope, organization_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Value::Array(Vec::new())),
            Err(e) => {
                return Err(ContextError::LoadFailed {
                    scope,
                    detail: format!("{}: {e}", path.display()),
                })
            }
        };
        serde_json::from_str(&raw).map_err(|e| ContextError::LoadFailed {
            scope,
            detail: format!("{}: {e}", path.display()),
        })
    }
}
