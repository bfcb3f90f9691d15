//! Engine configuration.
//!
//! Everything has a sensible default; env overrides (`FETCHMUX_*`) exist so
//! integration harnesses can shrink chunk sizes or queue depths without
//! recompiling.

use serde::{Deserialize, Serialize};

/// Default number of shown items delivered per `fetch_more` step for parents
/// that do not specify their own chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default bound on the sequential worker's job queue.
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 1024;

/// Tunables for one connection's fetch engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk size used when a parent reports `ChunkSize::Default`.
    pub default_chunk_size: usize,
    /// Capacity of the sequential worker's bounded job channel.  Submitting
    /// past this bound blocks the caller until the worker catches up.
    pub worker_queue_capacity: usize,
    /// Upper bound on query advances a single will-have-children probe may
    /// trigger before giving up for this round (0 = no bound).  The probe
    /// resumes on the next registration or completion for that type.
    pub probe_advance_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            probe_advance_limit: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            default_chunk_size: get("FETCHMUX_CHUNK_SIZE", defaults.default_chunk_size),
            worker_queue_capacity: get(
                "FETCHMUX_WORKER_QUEUE_CAPACITY",
                defaults.worker_queue_capacity,
            ),
            probe_advance_limit: get("FETCHMUX_PROBE_ADVANCE_LIMIT", defaults.probe_advance_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.default_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.worker_queue_capacity, DEFAULT_WORKER_QUEUE_CAPACITY);
        assert_eq!(config.probe_advance_limit, 0);
    }

    #[test]
    fn serde_round_trip() {
        let config = EngineConfig {
            default_chunk_size: 10,
            worker_queue_capacity: 4,
            probe_advance_limit: 2,
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: EngineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }

    #[test]
    fn env_overrides_apply_and_bad_values_fall_back() {
        let config = EngineConfig::from_lookup(|key| match key {
            "FETCHMUX_CHUNK_SIZE" => Some(" 42 ".to_string()),
            "FETCHMUX_PROBE_ADVANCE_LIMIT" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(config.default_chunk_size, 42);
        assert_eq!(config.worker_queue_capacity, DEFAULT_WORKER_QUEUE_CAPACITY);
        assert_eq!(config.probe_advance_limit, 0);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"default_chunk_size": 7}"#).expect("deserialize");
        assert_eq!(config.default_chunk_size, 7);
        assert_eq!(config.worker_queue_capacity, DEFAULT_WORKER_QUEUE_CAPACITY);
    }
}
