// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Bounds on the number of TRBs in one ring segment. 4096 TRBs fill the 64 KiB a segment may
/// not cross.
pub const MIN_SEGMENT_TRBS: usize = 2;
pub const MAX_SEGMENT_TRBS: usize = 4096;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid ring config: {0}")]
    Invalid(String),
    #[error("failed to parse ring config: {0}")]
    Parse(serde_json::Error),
    #[error("failed to read ring config {0}: {1}")]
    Read(PathBuf, io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_poll_interval_us() -> u64 {
    10
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_transfer_timeout_ms() -> u64 {
    5000
}

fn default_segment_trbs() -> usize {
    256
}

/// Settings threaded through every ring and the context store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RingConfig {
    /// Trace every published TRB and allow full ring dumps.
    #[serde(default)]
    pub debug: bool,
    /// Sleep between polls of the event ring. Zero busy-polls.
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Capacity of segments allocated without an explicit size.
    #[serde(default = "default_segment_trbs")]
    pub segment_trbs: usize,
    /// Caps the event ring below the controller's ERST Max when set.
    #[serde(default)]
    pub max_event_segments: Option<usize>,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            debug: false,
            poll_interval_us: default_poll_interval_us(),
            command_timeout_ms: default_command_timeout_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            segment_trbs: default_segment_trbs(),
            max_event_segments: None,
        }
    }
}

impl RingConfig {
    pub fn from_json_str(s: &str) -> Result<RingConfig> {
        let config: RingConfig = serde_json::from_str(s).map_err(Error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<RingConfig> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
        RingConfig::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SEGMENT_TRBS..=MAX_SEGMENT_TRBS).contains(&self.segment_trbs) {
            return Err(Error::Invalid(format!(
                "segment-trbs {} is outside {}..={}",
                self.segment_trbs, MIN_SEGMENT_TRBS, MAX_SEGMENT_TRBS
            )));
        }
        if self.max_event_segments == Some(0) {
            return Err(Error::Invalid("max-event-segments must be non-zero".into()));
        }
        Ok(())
    }

    /// `None` means busy-poll.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.poll_interval_us {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn defaults_from_empty_object() {
        let config = RingConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RingConfig::default());
        assert_eq!(config.poll_interval(), Some(Duration::from_micros(10)));
    }

    #[test]
    fn kebab_case_keys() {
        let json = r#"{
            "debug": true,
            "poll-interval-us": 0,
            "segment-trbs": 16,
            "max-event-segments": 2
        }"#;
        let config = RingConfig::from_json_str(json).unwrap();
        assert!(config.debug);
        assert_eq!(config.poll_interval(), None);
        assert_eq!(config.segment_trbs, 16);
        assert_eq!(config.max_event_segments, Some(2));
    }

    #[test]
    fn rejects_unknown_and_invalid() {
        assert!(matches!(
            RingConfig::from_json_str(r#"{"segment_trbs": 16}"#),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            RingConfig::from_json_str(r#"{"segment-trbs": 1}"#),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            RingConfig::from_json_str(r#"{"segment-trbs": 4097}"#),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"command-timeout-ms": 20}}"#).unwrap();
        let config = RingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_millis(20));
        assert!(matches!(
            RingConfig::from_file("/nonexistent/ring.json"),
            Err(Error::Read(..))
        ));
    }
}
