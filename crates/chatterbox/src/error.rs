//! Error taxonomy shared by every audio path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::Owner;

/// Engine errors.
///
/// Faults local to one audio path (decode, effect, actuator) are contained by
/// that path and surface through status; ownership conflicts and device-open
/// failures are returned to the caller of the failing operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatterError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio device busy (held by {holder})")]
    DeviceBusy { holder: Owner },

    #[error("cannot decode track: {0}")]
    DecodeFailure(String),

    #[error("effect chain failed: {0}")]
    EffectFailure(String),

    #[error("effect chain missed its deadline ({elapsed:?} > {budget:?})")]
    EffectOverrun { elapsed: Duration, budget: Duration },

    #[error("actuator fault: {0}")]
    ActuatorFault(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("settings store: {0}")]
    Store(String),
}

impl From<chatterconf::SettingsError> for ChatterError {
    fn from(e: chatterconf::SettingsError) -> Self {
        match e {
            chatterconf::SettingsError::Invalid { .. } => ChatterError::ConfigInvalid(e.to_string()),
            other => ChatterError::Store(other.to_string()),
        }
    }
}

/// A failure as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Most recent failure from any component.
///
/// Cloned into each audio path so that asynchronous failures (a job that
/// fails mid-clip, a crashed session) stay queryable after the fact.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    inner: Arc<Mutex<Option<LastError>>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: &ChatterError) {
        self.record_message(error.to_string());
    }

    pub fn record_message(&self, message: impl Into<String>) {
        *crate::lock(&self.inner) = Some(LastError {
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn get(&self) -> Option<LastError> {
        crate::lock(&self.inner).clone()
    }

    pub fn clear(&self) {
        *crate::lock(&self.inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_names_holder() {
        let err = ChatterError::DeviceBusy { holder: Owner::Live };
        assert_eq!(err.to_string(), "audio device busy (held by live)");
    }

    #[test]
    fn test_settings_errors_map_to_taxonomy() {
        let invalid = chatterconf::SettingsError::Invalid {
            field: "servo.open_angle".into(),
            reason: "too small".into(),
        };
        assert!(matches!(ChatterError::from(invalid), ChatterError::ConfigInvalid(_)));

        let parse = chatterconf::SettingsError::Parse {
            path: "settings.json".into(),
            message: "eof".into(),
        };
        assert!(matches!(ChatterError::from(parse), ChatterError::Store(_)));
    }

    #[test]
    fn test_error_slot_keeps_latest() {
        let slot = ErrorSlot::new();
        assert!(slot.get().is_none());

        slot.record(&ChatterError::DecodeFailure("first".into()));
        slot.record(&ChatterError::DeviceUnavailable("second".into()));
        let last = slot.get().unwrap();
        assert!(last.message.contains("second"));

        slot.clear();
        assert!(slot.get().is_none());
    }
}
