// vim: tw=80
//! Tunables for the copy state machine
//!
//! Nothing here is global.  Each [`CopyStateMachine`](crate::copy::CopyStateMachine)
//! gets its own `CopyConfig`, so tests can use whatever timer values they
//! like.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Whether extended media error handling is allowed to touch drive
/// thresholds at all.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum EmehMode {
    #[default]
    Enabled,
    Disabled,
}

/// Serialize a `Duration` as an integer number of milliseconds
mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S)
        -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D)
        -> std::result::Result<Duration, D::Error>
        where D: Deserializer<'de>
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CopyConfig {
    /// How long a source edge may stay down before the copy treats it as
    /// permanently failed.
    #[serde(with = "millis")]
    pub grace_window: Duration,

    /// How long a position may stay degraded before a permanent spare is
    /// swapped in.  This timer only starts once the grace window has expired.
    #[serde(with = "millis")]
    pub permanent_spare_trigger: Duration,

    /// Size of one bitmap chunk, in blocks.  Must be a power of two.
    pub chunk_size: LbaT,

    /// On source loss, a copy at least this far along completes onto the
    /// destination instead of aborting.
    pub complete_onto_destination_percent: u8,

    pub emeh_mode: EmehMode,

    /// Percent by which media-error thresholds are raised during a copy
    pub emeh_threshold_increase: u32,
}

impl CopyConfig {
    /// Load a configuration from YAML.  Missing fields take their defaults.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: CopyConfig = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                tracing::warn!("unparseable copy configuration: {e}");
                Error::InvalidConfig("unparseable YAML")
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(Error::InvalidConfig(
                    "chunk size must be a nonzero power of two"));
        }
        if self.grace_window.is_zero() {
            return Err(Error::InvalidConfig("grace window must be nonzero"));
        }
        if self.complete_onto_destination_percent > 100 {
            return Err(Error::InvalidConfig("percent may not exceed 100"));
        }
        Ok(())
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        CopyConfig {
            grace_window: Duration::from_secs(5),
            permanent_spare_trigger: Duration::from_secs(300),
            chunk_size: 0x800,
            complete_onto_destination_percent: 90,
            emeh_mode: EmehMode::Enabled,
            emeh_threshold_increase: 100,
        }
    }
}

// LCOV_EXCL_STOP
