//! # ember-settings
//!
//! Layered configuration for the session orchestrator.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EmberSettings::default()`]
//! 2. **User file**: `~/.ember/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `EMBER_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = ember_settings::load_settings()?;
//! println!("poll every {:?}", settings.orchestrator.poll_interval());
//! # Ok::<(), ember_settings::SettingsError>(())
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;
