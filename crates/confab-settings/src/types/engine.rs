//! Engine, generator, storage, and context-data settings.

use serde::{Deserialize, Serialize};

/// Orchestration engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Upper bound for a single agent invocation, delegation included.
    pub invocation_timeout_ms: u64,
    /// Number of recent messages handed to an agent as history.
    pub history_window: usize,
    /// Capacity of the engine event broadcast channel.
    pub event_capacity: usize,
    /// Recent message ids remembered per conversation for read receipts.
    pub unread_window: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: 60_000,
            history_window: 20,
            event_capacity: 1024,
            unread_window: 500,
        }
    }
}

/// Reply generator backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratorSettings {
    /// `anthropic` or `mock`.
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite file path. `:memory:` keeps everything in process.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "confab.db".to_string(),
        }
    }
}

/// Where scoped organizational data is read from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Directory laid out as `<dir>/<organization>/<scope>.json`.
    pub data_dir: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}
