//! # duet-settings
//!
//! Layered configuration for the duet delivery core.
//!
//! Settings come from three layers, lowest priority first:
//! 1. compiled defaults ([`DuetSettings::default()`])
//! 2. the JSON file at `$DUET_CONFIG` or `~/.duet/settings.json`
//! 3. `DUET_*` environment variables

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
