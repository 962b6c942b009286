//! Patch settings
//!
//! Read once at install time. Every field has a default matching the
//! unmodified host, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use steady_core::buffer::BufferLayout;
use steady_core::time::{ClockConfig, RESET_DELTA, TICK_SCALE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Patch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub timers: TimerSettings,
    pub buffer: BufferSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    pub enabled: bool,
    pub tick_scale: i64,
    pub reset_delta: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub enabled: bool,
    pub stride: usize,
    pub align: usize,
    pub initial_capacity: usize,
    pub max_capacity: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            timers: TimerSettings::default(),
            buffer: BufferSettings::default(),
        }
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_scale: TICK_SCALE,
            reset_delta: RESET_DELTA,
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            stride: 4,
            align: 4,
            initial_capacity: 1024,
            max_capacity: None,
        }
    }
}

impl Settings {
    pub fn from_json_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field, reason| Err(SettingsError::Invalid { field, reason });
        if self.timers.tick_scale <= 0 {
            return invalid("timers.tick_scale", "must be positive");
        }
        if self.timers.reset_delta < 0 {
            return invalid("timers.reset_delta", "must not be negative");
        }
        if self.buffer.stride == 0 {
            return invalid("buffer.stride", "must be non-zero");
        }
        if !self.buffer.align.is_power_of_two() {
            return invalid("buffer.align", "must be a power of two");
        }
        if self.buffer.initial_capacity == 0 || self.buffer.initial_capacity > u32::MAX as usize {
            return invalid("buffer.initial_capacity", "must be between 1 and 2^32 - 1");
        }
        if matches!(self.buffer.max_capacity, Some(max) if max < self.buffer.initial_capacity) {
            return invalid("buffer.max_capacity", "must not be below initial_capacity");
        }
        Ok(())
    }
}

impl From<&TimerSettings> for ClockConfig {
    fn from(timers: &TimerSettings) -> Self {
        ClockConfig {
            tick_scale: timers.tick_scale,
            reset_delta: timers.reset_delta,
        }
    }
}

impl From<&BufferSettings> for BufferLayout {
    fn from(buffer: &BufferSettings) -> Self {
        let layout = BufferLayout::new(buffer.stride, buffer.initial_capacity).with_align(buffer.align);
        match buffer.max_capacity {
            Some(max) => layout.with_max_capacity(max),
            None => layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = Settings::from_json_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.timers.tick_scale, 3_276_800);
        assert_eq!(settings.timers.reset_delta, 65_536);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let settings =
            Settings::from_json_str(r#"{ "buffer": { "stride": 32, "max_capacity": 8192 } }"#).unwrap();
        assert_eq!(settings.buffer.stride, 32);
        assert_eq!(settings.buffer.initial_capacity, 1024);
        assert_eq!(settings.buffer.max_capacity, Some(8192));
        assert!(settings.timers.enabled);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Settings::from_json_str(r#"{ "buffer": { "align": 6 } }"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "buffer.align", .. }));

        let err = Settings::from_json_str(r#"{ "timers": { "tick_scale": 0 } }"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "timers.tick_scale", .. }));

        let err = Settings::from_json_str(r#"{ "buffer": { "max_capacity": 10 } }"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "buffer.max_capacity", .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(Settings::from_json_str("{ nope"), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Settings::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }

    #[test]
    fn converts_into_core_configs() {
        let mut settings = Settings::default();
        settings.buffer.max_capacity = Some(4096);
        let layout = BufferLayout::from(&settings.buffer);
        assert_eq!(layout.stride, 4);
        assert_eq!(layout.initial_capacity, 1024);
        assert_eq!(layout.max_capacity, Some(4096));
        assert_eq!(ClockConfig::from(&settings.timers), ClockConfig::default());
    }
}
