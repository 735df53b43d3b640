//! Per-session acquisition settings.
//!
//! The settings layer of the host hands one of these to the session before
//! every sampling start. They can also be loaded from a JSON file for the CLI.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::protocol::Protocol;
use crate::ring_buffer::{buffer_size_for, MAX_CAPACITY};

/// What to do with a frame whose trailing CRC does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcPolicy {
    /// Count and log the mismatch but still use the payload.
    #[default]
    Lenient,
    /// Drop the frame and resume scanning one byte past its anchor.
    Strict,
}

/// Device-specific options folded into the start command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// NIBP cuff cycling mode (0 = manual).
    pub cuff_mode: u8,
    pub test_mode: bool,
    pub calibrate: bool,
    /// Input range / gain selector, device defined.
    pub gain: u8,
    /// Teensy ADC: ten points per data packet instead of one.
    pub large_packets: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Output channels to record; `None` enables every channel of the protocol.
    pub enabled_channels: Option<Vec<usize>>,
    pub sample_rate_hz: f64,
    /// Seconds of data each ring buffer must be able to hold.
    pub buffer_seconds: f64,
    /// Lower bound for the ring buffer size, in samples.
    pub min_buffer_samples: usize,
    /// Keep sampling (zero padded) after a critical device error.
    pub continue_on_error: bool,
    pub crc_policy: CrcPolicy,
    pub watchdog_timeout_ms: u64,
    /// 0 disables the keep-alive.
    pub keep_alive_ms: u64,
    /// Window after which a still-active alarm is reported again.
    pub alarm_repeat_ms: u64,
    /// Largest counter jump still treated as packet loss; larger jumps resync.
    pub max_sequence_gap: Option<u32>,
    pub options: DeviceOptions,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enabled_channels: None,
            sample_rate_hz: 1000.0,
            buffer_seconds: 10.0,
            min_buffer_samples: 1024,
            continue_on_error: false,
            crc_policy: CrcPolicy::Lenient,
            watchdog_timeout_ms: 2000,
            keep_alive_ms: 500,
            alarm_repeat_ms: 30_000,
            max_sequence_gap: None,
            options: DeviceOptions::default(),
        }
    }
}

impl SessionSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Check the settings against the protocol they will drive.
    pub fn validate(&self, protocol: &Protocol) -> Result<()> {
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 {
            return Err(DriverError::Config(format!(
                "invalid sample rate {}",
                self.sample_rate_hz
            )));
        }
        if !self.buffer_seconds.is_finite() || self.buffer_seconds < 0.0 {
            return Err(DriverError::Config(format!(
                "invalid buffer length {}s",
                self.buffer_seconds
            )));
        }
        let size = self.buffer_samples();
        if size >= MAX_CAPACITY {
            return Err(DriverError::Config(format!(
                "buffer size {size} samples exceeds the limit of {} samples",
                MAX_CAPACITY - 1
            )));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(DriverError::Config("watchdog timeout must be > 0".into()));
        }
        if let Some(channels) = &self.enabled_channels {
            if let Some(bad) = channels.iter().find(|&&ch| ch >= protocol.channels.len()) {
                return Err(DriverError::Config(format!(
                    "channel {bad} does not exist ({} has {} channels)",
                    protocol.name,
                    protocol.channels.len()
                )));
            }
        }
        if !self.enabled_mask(protocol).iter().any(|&on| on) {
            return Err(DriverError::Config("no channels enabled".into()));
        }
        Ok(())
    }

    /// Samples each channel buffer must hold.
    pub fn buffer_samples(&self) -> usize {
        buffer_size_for(
            self.buffer_seconds,
            self.sample_rate_hz,
            self.min_buffer_samples,
        )
    }

    /// Enabled flag per protocol channel.
    pub fn enabled_mask(&self, protocol: &Protocol) -> Vec<bool> {
        let n = protocol.channels.len();
        match &self.enabled_channels {
            None => vec![true; n],
            Some(list) => (0..n).map(|ch| list.contains(&ch)).collect(),
        }
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn keep_alive_period(&self) -> Option<Duration> {
        (self.keep_alive_ms > 0).then(|| Duration::from_millis(self.keep_alive_ms))
    }

    pub fn alarm_repeat(&self) -> Duration {
        Duration::from_millis(self.alarm_repeat_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NIBP, TEENSY_ADC};

    #[test]
    fn test_defaults_validate() {
        let settings = SessionSettings::default();
        assert!(settings.validate(&TEENSY_ADC).is_ok());
        assert_eq!(settings.enabled_mask(&TEENSY_ADC), vec![true, true]);
        assert_eq!(settings.keep_alive_period(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "enabled_channels": [1], "crc_policy": "strict", "options": { "cuff_mode": 2 } }"#;
        let settings = SessionSettings::from_json_str(json).unwrap();
        assert_eq!(settings.crc_policy, CrcPolicy::Strict);
        assert_eq!(settings.options.cuff_mode, 2);
        assert_eq!(settings.sample_rate_hz, 1000.0);
        assert_eq!(settings.enabled_mask(&TEENSY_ADC), vec![false, true]);
    }

    #[test]
    fn test_rejects_bad_settings() {
        let mut settings = SessionSettings {
            sample_rate_hz: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(&TEENSY_ADC),
            Err(DriverError::Config(_))
        ));

        settings.sample_rate_hz = 500.0;
        settings.enabled_channels = Some(vec![5]);
        assert!(settings.validate(&TEENSY_ADC).is_err());
        assert!(settings.validate(&NIBP).is_ok());

        settings.enabled_channels = Some(vec![]);
        assert!(settings.validate(&NIBP).is_err());
    }

    #[test]
    fn test_rejects_oversized_buffers() {
        let settings = SessionSettings {
            buffer_seconds: 1e30,
            ..Default::default()
        };
        let err = settings.validate(&TEENSY_ADC).unwrap_err();
        assert!(err.to_string().contains("buffer size"));

        let settings = SessionSettings {
            min_buffer_samples: usize::MAX,
            ..Default::default()
        };
        assert!(settings.validate(&TEENSY_ADC).is_err());

        let settings = SessionSettings {
            buffer_seconds: 3600.0,
            ..Default::default()
        };
        assert_eq!(settings.buffer_samples(), 3_600_000);
        assert!(settings.validate(&TEENSY_ADC).is_ok());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            SessionSettings::from_json_str("{ not json"),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn test_keep_alive_disabled() {
        let settings = SessionSettings {
            keep_alive_ms: 0,
            ..Default::default()
        };
        assert_eq!(settings.keep_alive_period(), None);
    }
}
