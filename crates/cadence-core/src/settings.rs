//! Runtime settings and validation.
//!
//! Pure data: loading from disk or the command line is the binary's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default inactivity window before an unused session expires.
pub const DEFAULT_SESSION_INACTIVITY_TIMEOUT_MS: u64 = 30_000;

/// Default deadline for a context request.
pub const DEFAULT_CONTEXT_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Default debounce before the dialog UX falls back to idle.
pub const DEFAULT_UX_IDLE_DEBOUNCE_MS: u64 = 200;

/// Default ring buffer size: one second of 16 kHz, 16-bit mono PCM.
pub const DEFAULT_AUDIO_BUFFER_CAPACITY: usize = 32_000;

/// Runtime settings.
///
/// All fields are optional to support partial files and graceful defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// How long a session with no active requester survives (1 ms to 1 h).
    pub session_inactivity_timeout_ms: Option<u64>,

    /// Deadline for every context request (1 ms to 60 s).
    pub context_request_timeout_ms: Option<u64>,

    /// Debounce before the UX state falls back to idle (0 to 10 s).
    pub ux_idle_debounce_ms: Option<u64>,

    /// Capacity of audio ring streams, in bytes (> 0).
    pub audio_buffer_capacity: Option<usize>,
}

impl Settings {
    /// Create settings with sensible defaults.
    #[must_use]
    pub const fn with_defaults() -> Self {
        Self {
            session_inactivity_timeout_ms: Some(DEFAULT_SESSION_INACTIVITY_TIMEOUT_MS),
            context_request_timeout_ms: Some(DEFAULT_CONTEXT_REQUEST_TIMEOUT_MS),
            ux_idle_debounce_ms: Some(DEFAULT_UX_IDLE_DEBOUNCE_MS),
            audio_buffer_capacity: Some(DEFAULT_AUDIO_BUFFER_CAPACITY),
        }
    }

    #[must_use]
    pub const fn effective_session_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(match self.session_inactivity_timeout_ms {
            Some(ms) => ms,
            None => DEFAULT_SESSION_INACTIVITY_TIMEOUT_MS,
        })
    }

    #[must_use]
    pub const fn effective_context_request_timeout(&self) -> Duration {
        Duration::from_millis(match self.context_request_timeout_ms {
            Some(ms) => ms,
            None => DEFAULT_CONTEXT_REQUEST_TIMEOUT_MS,
        })
    }

    #[must_use]
    pub const fn effective_ux_idle_debounce(&self) -> Duration {
        Duration::from_millis(match self.ux_idle_debounce_ms {
            Some(ms) => ms,
            None => DEFAULT_UX_IDLE_DEBOUNCE_MS,
        })
    }

    #[must_use]
    pub const fn effective_audio_buffer_capacity(&self) -> usize {
        match self.audio_buffer_capacity {
            Some(capacity) => capacity,
            None => DEFAULT_AUDIO_BUFFER_CAPACITY,
        }
    }

    /// Merge an update into these settings, only touching fields that are `Some`.
    pub fn merge(&mut self, other: &SettingsUpdate) {
        if let Some(timeout) = other.session_inactivity_timeout_ms {
            self.session_inactivity_timeout_ms = timeout;
        }
        if let Some(timeout) = other.context_request_timeout_ms {
            self.context_request_timeout_ms = timeout;
        }
        if let Some(debounce) = other.ux_idle_debounce_ms {
            self.ux_idle_debounce_ms = debounce;
        }
        if let Some(capacity) = other.audio_buffer_capacity {
            self.audio_buffer_capacity = capacity;
        }
    }
}

/// Partial settings update.
///
/// Each field is `Option<Option<T>>`:
/// - `None` = don't change this field
/// - `Some(None)` = reset the field to its default
/// - `Some(Some(value))` = set the field to value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub session_inactivity_timeout_ms: Option<Option<u64>>,
    pub context_request_timeout_ms: Option<Option<u64>>,
    pub ux_idle_debounce_ms: Option<Option<u64>>,
    pub audio_buffer_capacity: Option<Option<usize>>,
}

/// Settings validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Session inactivity timeout must be between 1 ms and 1 hour, got {0} ms")]
    InvalidSessionTimeout(u64),

    #[error("Context request timeout must be between 1 ms and 60 s, got {0} ms")]
    InvalidContextTimeout(u64),

    #[error("UX idle debounce must be at most 10 s, got {0} ms")]
    InvalidIdleDebounce(u64),

    #[error("Audio buffer capacity must be greater than zero")]
    EmptyAudioBuffer,
}

/// Validate settings values.
pub fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    if let Some(ms) = settings.session_inactivity_timeout_ms {
        if !(1..=3_600_000).contains(&ms) {
            return Err(SettingsError::InvalidSessionTimeout(ms));
        }
    }

    if let Some(ms) = settings.context_request_timeout_ms {
        if !(1..=60_000).contains(&ms) {
            return Err(SettingsError::InvalidContextTimeout(ms));
        }
    }

    if let Some(ms) = settings.ux_idle_debounce_ms {
        if ms > 10_000 {
            return Err(SettingsError::InvalidIdleDebounce(ms));
        }
    }

    if settings.audio_buffer_capacity == Some(0) {
        return Err(SettingsError::EmptyAudioBuffer);
    }

    Ok(())
}
