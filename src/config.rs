//! VM tuning knobs.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Settings a host passes to [`crate::vm::Vm::with_config`].
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Heap size that triggers the first collection.
    pub first_gc_threshold: usize,
    /// Multiplier applied to the live heap to pick the next threshold.
    pub heap_grow_rate: f64,
    /// Hard ceiling on the heap. `None` means unlimited.
    pub max_heap_bytes: Option<usize>,
    /// Maximum depth of the bytecode call stack.
    pub max_frames: usize,
    /// Maximum nesting of host-to-script re-entrant calls.
    pub max_reentrant: usize,
    /// Initial capacity reserved for the value stack.
    pub initial_stack: usize,
    /// Print uncaught exceptions to stderr.
    pub print_uncaught: bool,
    /// Emit a `trace!` event per executed instruction.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            first_gc_threshold: 10 * 1024 * 1024,
            heap_grow_rate: 2.0,
            max_heap_bytes: None,
            max_frames: 1000,
            max_reentrant: 200,
            initial_stack: 256,
            print_uncaught: true,
            trace_execution: false,
        }
    }
}

impl VmConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.heap_grow_rate > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "heap_grow_rate must be greater than 1.0, got {}",
                self.heap_grow_rate
            )));
        }
        if self.max_frames == 0 {
            return Err(ConfigError::Invalid("max_frames must be at least 1".into()));
        }
        if self.max_reentrant == 0 {
            return Err(ConfigError::Invalid(
                "max_reentrant must be at least 1".into(),
            ));
        }
        if let Some(max) = self.max_heap_bytes {
            if max < self.first_gc_threshold {
                return Err(ConfigError::Invalid(format!(
                    "max_heap_bytes ({}) is below first_gc_threshold ({})",
                    max, self.first_gc_threshold
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = VmConfig::from_json_str(r#"{ "max_frames": 64, "print_uncaught": false }"#)
            .unwrap();
        assert_eq!(
            config,
            VmConfig {
                max_frames: 64,
                print_uncaught: false,
                ..VmConfig::default()
            }
        );
    }

    #[test]
    fn test_rejects_bad_grow_rate() {
        let err = VmConfig::from_json_str(r#"{ "heap_grow_rate": 1.0 }"#).unwrap_err();
        assert!(err.to_string().contains("heap_grow_rate"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            VmConfig::from_json_str("{ max_frames: }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_heap_ceiling_below_threshold() {
        let config = VmConfig {
            max_heap_bytes: Some(1024),
            ..VmConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
