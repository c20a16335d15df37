//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs the keys it changes.

mod engine;
mod server;

pub use engine::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the confab server and engine.
///
/// ```json
/// {
///   "server": { "port": 9100 },
///   "engine": { "invocationTimeoutMs": 30000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfabSettings {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub generator: GeneratorSettings,
    pub storage: StorageSettings,
    pub context: ContextSettings,
    pub logging: LoggingSettings,
}

impl ConfabSettings {
    /// Reject combinations that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.engine.history_window == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.historyWindow must be at least 1".into(),
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.eventCapacity must be at least 1".into(),
            ));
        }
        if self.engine.invocation_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.invocationTimeoutMs must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be at least 1".into(),
            ));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSendQueue must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
