//! # confab-settings
//!
//! Layered configuration for the confab server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConfabSettings::default()`]
//! 2. **Settings file**: `~/.confab/settings.json` or an explicit path
//! 3. **Environment variables**: `CONFAB_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = confab_settings::load_settings().unwrap_or_default();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, read_settings_file,
    settings_path,
};
pub use types::*;
