//! The engine's configuration surface: a `serde`-deserializable struct
//! collaborators build once and hand to [`crate::registry::StorageChannelsRegistry::open`].
//! Per-channel ring sizing, global capacity, and flush intervals all live here.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-channel memory ring size (bytes) when no prefix rule matches.
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// Memory-tier flush cadence: 250 ms.
pub const DEFAULT_MEMORY_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Index-file flush cadence: 60 s.
pub const DEFAULT_INDEX_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// One entry of the per-channel-name-prefix memory ring sizing rule set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RingSizeRule {
    pub prefix: String,
    pub capacity_bytes: usize,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding `overflow.dat`, `ofchannels.csv`, and `*.rq` dumps.
    pub data_dir: PathBuf,

    /// Per-channel-name-prefix memory ring sizes. Prefixes must not overlap.
    #[serde(default)]
    pub ring_sizes: Vec<RingSizeRule>,

    /// Memory ring size used when no prefix rule matches.
    #[serde(default = "default_ring_capacity")]
    pub default_ring_capacity: usize,

    /// Sum of every channel's memory-ring capacity may not exceed this.
    #[serde(default)]
    pub global_capacity_bytes: Option<usize>,

    #[serde(default = "default_memory_flush_interval", with = "millis")]
    pub memory_flush_interval: Duration,

    #[serde(default = "default_index_flush_interval", with = "millis")]
    pub index_flush_interval: Duration,
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_memory_flush_interval() -> Duration {
    DEFAULT_MEMORY_FLUSH_INTERVAL
}

fn default_index_flush_interval() -> Duration {
    DEFAULT_INDEX_FLUSH_INTERVAL
}

impl EngineConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ring_sizes: Vec::new(),
            default_ring_capacity: DEFAULT_RING_CAPACITY,
            global_capacity_bytes: None,
            memory_flush_interval: DEFAULT_MEMORY_FLUSH_INTERVAL,
            index_flush_interval: DEFAULT_INDEX_FLUSH_INTERVAL,
        }
    }

    /// Validates that no two configured prefixes overlap (one is a prefix
    /// of the other).
    pub fn validate(&self) -> Result<(), String> {
        for (i, a) in self.ring_sizes.iter().enumerate() {
            for b in self.ring_sizes.iter().skip(i + 1) {
                if a.prefix.starts_with(&b.prefix) || b.prefix.starts_with(&a.prefix) {
                    return Err(format!(
                        "ring size prefixes {:?} and {:?} overlap",
                        a.prefix, b.prefix
                    ));
                }
            }
        }
        Ok(())
    }

    /// Longest-prefix-wins capacity lookup, falling back to
    /// [`Self::default_ring_capacity`].
    pub fn capacity_for(&self, channel_name: &str) -> usize {
        self.ring_sizes
            .iter()
            .filter(|rule| channel_name.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.capacity_bytes)
            .unwrap_or(self.default_ring_capacity)
    }
}

/// Minimal millisecond-based `serde::with` module for `Duration`; avoids a
/// dedicated humantime dependency for two fields.
mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
