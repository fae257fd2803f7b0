//! # stride-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`StrideSettings::default()`]
//! 2. **User file**: `~/.stride/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `STRIDE_*` overrides (highest priority)
//!
//! Every default is a named constant in [`types`] so tests and callers can
//! refer to the tuning values by name.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path, stride_dir};
pub use types::*;
