//! Settings loading for the binary.
//!
//! Settings come from an optional JSON file, then command-line overrides are
//! merged on top. Missing fields fall back to their defaults.

use std::fs;
use std::path::Path;

use cadence_core::{Settings, SettingsUpdate, validate_settings};

use crate::error::CliError;

/// Load settings from `path` (defaults if `None`), apply `overrides`, validate.
pub fn load_settings(path: Option<&Path>, overrides: &SettingsUpdate) -> Result<Settings, CliError> {
    let mut settings = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
            let settings: Settings = serde_json::from_str(&raw)
                .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
            tracing::debug!(path = %path.display(), "Loaded settings file");
            settings
        }
        None => Settings::with_defaults(),
    };

    settings.merge(overrides);
    validate_settings(&settings)?;
    Ok(settings)
}
