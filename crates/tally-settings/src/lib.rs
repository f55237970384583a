//! # tally-settings
//!
//! Configuration for the tally reporter, loaded in three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`TallySettings::default()`]
//! 2. **Settings file**: `~/.tally/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `TALLY_*` overrides (highest priority)
//!
//! [`TallySettings::validate`] turns the merged value into
//! [`ValidatedSettings`]; a failure there is the only fatal error in the
//! reporter and stops it before the coordinator starts.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
