//! Configuration for the realtime core.
//!
//! One `CoreConfig` value is built once and threaded through every
//! component's constructor; no component reads global or env state
//! directly. Loading it from a file or environment is an external
//! wiring concern and not part of this crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the realtime core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// This node's label, carried on every presence id and match id.
    pub node: String,

    pub tracker: TrackerConfig,
    pub status: StatusConfig,
    pub match_registry: MatchRegistryConfig,
    pub match_handler: MatchHandlerConfig,
    pub party: PartyConfig,
    pub notification: NotificationConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node: "node1".to_string(),
            tracker: TrackerConfig::default(),
            status: StatusConfig::default(),
            match_registry: MatchRegistryConfig::default(),
            match_handler: MatchHandlerConfig::default(),
            party: PartyConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Reject configuration that would violate a data-model invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.is_empty() {
            return Err("node must not be empty".to_string());
        }
        if self.tracker.event_queue_size == 0 {
            return Err("tracker.event_queue_size must be > 0".to_string());
        }
        if self.match_registry.max_label_bytes == 0 {
            return Err("match_registry.max_label_bytes must be > 0".to_string());
        }
        if !(1..=60).contains(&self.match_handler.default_tick_rate) {
            return Err("match_handler.default_tick_rate must be in 1..=60".to_string());
        }
        if self.party.default_max_size == 0 {
            return Err("party.default_max_size must be > 0".to_string());
        }
        Ok(())
    }
}

/// Presence tracker queue sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Bounded channel capacity for join/leave event batches.
    pub event_queue_size: usize,
    /// Upper bound on presences drained from the call queue per `TrackMulti`.
    pub max_event_batch: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            event_queue_size: 1024,
            max_event_batch: 256,
        }
    }
}

/// Status registry queue sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusConfig {
    pub event_queue_size: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            event_queue_size: 1024,
        }
    }
}

/// Match registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRegistryConfig {
    /// How often the label-index batcher applies pending updates.
    #[serde(with = "duration_millis")]
    pub label_index_batch_interval: Duration,
    /// Hard deadline for `JoinAttempt`, per spec always 10 seconds.
    #[serde(with = "duration_millis")]
    pub join_attempt_timeout: Duration,
    /// Maximum length, in bytes, of a match label.
    pub max_label_bytes: usize,
}

impl Default for MatchRegistryConfig {
    fn default() -> Self {
        Self {
            label_index_batch_interval: Duration::from_millis(250),
            join_attempt_timeout: Duration::from_secs(10),
            max_label_bytes: 2048,
        }
    }
}

/// Per-match tick loop tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchHandlerConfig {
    /// Maximum call-queue messages drained per tick.
    pub max_calls_per_tick: usize,
    /// Capacity of the deferred-broadcast buffer, flushed once per tick.
    pub deferred_broadcast_cap: usize,
    /// Tick rate used when a match's factory does not override it.
    pub default_tick_rate: u8,
}

impl Default for MatchHandlerConfig {
    fn default() -> Self {
        Self {
            max_calls_per_tick: 100,
            deferred_broadcast_cap: 256,
            default_tick_rate: 10,
        }
    }
}

/// Party defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartyConfig {
    pub default_max_size: usize,
}

impl Default for PartyConfig {
    fn default() -> Self {
        Self {
            default_max_size: 8,
        }
    }
}

/// Notification defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(with = "duration_millis")]
    pub default_expiry: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_expiry: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
