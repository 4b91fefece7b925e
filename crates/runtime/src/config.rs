//! Embedder-tunable knobs for an [`crate::engine::Engine`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration accepted by [`crate::engine::Engine::new`]. Every field has a
/// sensible default; embedders typically only override `max_execution_time_ms`.
/// Deserializable so a host can load it from a TOML config file rather than
/// building it by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Relaxes module-top-level redefinition so the same `Engine` can compile
    /// one fragment after another against accumulated state, as a REPL does.
    pub repl_mode: bool,
    /// Wall-clock budget per `run`/`call`, in milliseconds. `None` disables
    /// the timeout check entirely (the dispatch loop still counts
    /// instructions, it just never compares against a deadline).
    pub max_execution_time_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repl_mode: false,
            max_execution_time_ms: Some(5_000),
        }
    }
}

impl EngineConfig {
    pub fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_time_ms.map(Duration::from_millis)
    }

    pub fn with_max_execution_time_ms(mut self, ms: Option<u64>) -> Self {
        self.max_execution_time_ms = ms;
        self
    }

    pub fn with_repl_mode(mut self, repl_mode: bool) -> Self {
        self.repl_mode = repl_mode;
        self
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_a_timeout() {
        let cfg = EngineConfig::default();
        assert!(cfg.max_execution_time().is_some());
        assert!(!cfg.repl_mode);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let cfg = EngineConfig::default().with_max_execution_time_ms(None).with_repl_mode(true);
        assert!(cfg.max_execution_time().is_none());
        assert!(cfg.repl_mode);
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let cfg = EngineConfig::from_toml("repl_mode = true").unwrap();
        assert!(cfg.repl_mode);
        assert_eq!(cfg.max_execution_time_ms, Some(5_000));
    }
}
