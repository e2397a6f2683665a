//! Service-wide configuration.

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of entries a replica queue holds before the overflow policy applies.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default client acknowledgment interval (ms).
pub const DEFAULT_ACK_INTERVAL_MS: u64 = 100;

/// Default durable client timeout (ms).
pub const DEFAULT_DURABLE_TIMEOUT_MS: u64 = 300_000;

/// Queue configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-replica capacity used when a subscription doesn't set its own.
    pub default_capacity: usize,

    /// Dispatched identities per QRM broadcast.
    /// Default: 100
    pub ack_batch_size: usize,

    /// Ack interval applied to subscriptions that don't set their own.
    #[serde(with = "duration_ms")]
    pub default_ack_interval: Duration,

    /// Durable timeout applied to subscriptions that don't set their own.
    #[serde(with = "duration_ms")]
    pub default_durable_timeout: Duration,

    /// How long a background dispatcher waits for a new event before re-checking control messages.
    #[serde(with = "duration_ms")]
    pub event_wait_timeout: Duration,

    /// Producer streams remembered by a client event tracker.
    pub tracker_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_QUEUE_CAPACITY,
            ack_batch_size: 100,
            default_ack_interval: Duration::from_millis(DEFAULT_ACK_INTERVAL_MS),
            default_durable_timeout: Duration::from_millis(DEFAULT_DURABLE_TIMEOUT_MS),
            event_wait_timeout: Duration::from_millis(50),
            tracker_capacity: 1024,
        }
    }
}

impl QueueConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: QueueConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatcher can't work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "default_capacity must be positive".into(),
            ));
        }
        if self.ack_batch_size == 0 {
            return Err(QueueError::InvalidConfig(
                "ack_batch_size must be positive".into(),
            ));
        }
        if self.event_wait_timeout.is_zero() {
            return Err(QueueError::InvalidConfig(
                "event_wait_timeout must be positive".into(),
            ));
        }
        if self.tracker_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "tracker_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
