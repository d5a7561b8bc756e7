//! CLI error type and exit codes.

use cadence_audio::AudioError;
use cadence_core::{SchedulerError, SettingsError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Settings file missing, unreadable or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The runtime could not be wired or a turn did not settle.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl CliError {
    /// Exit code following sysexits.h.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78, // EX_CONFIG
            Self::Runtime(_) => 70, // EX_SOFTWARE
        }
    }
}

impl From<SettingsError> for CliError {
    fn from(err: SettingsError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<AudioError> for CliError {
    fn from(err: AudioError) -> Self {
        Self::Runtime(format!("audio: {err}"))
    }
}

impl From<SchedulerError> for CliError {
    fn from(err: SchedulerError) -> Self {
        Self::Runtime(err.to_string())
    }
}
