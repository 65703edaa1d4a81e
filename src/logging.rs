//! Tracing subscriber setup.
//!
//! The runtime emits events under three targets:
//! - `corvid::compiler`: one event per compiled function;
//! - `corvid::vm`: module loads, uncaught exceptions, and per-instruction
//!   traces when `trace_execution` is on;
//! - `corvid::gc`: one event per collection cycle.
//!
//! Installing a subscriber is left to the host. These helpers cover the
//! common cases and never panic if a global subscriber already exists.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const COMPILER_TARGET: &str = "corvid::compiler";
pub const VM_TARGET: &str = "corvid::vm";
pub const GC_TARGET: &str = "corvid::gc";

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV: &str = "CORVID_LOG";

/// Output format of the console layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// Per-target verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevels {
    pub default: LevelFilter,
    pub compiler: LevelFilter,
    pub vm: LevelFilter,
    pub gc: LevelFilter,
}

impl Default for LogLevels {
    fn default() -> Self {
        Self {
            default: LevelFilter::WARN,
            compiler: LevelFilter::WARN,
            vm: LevelFilter::WARN,
            gc: LevelFilter::WARN,
        }
    }
}

impl LogLevels {
    /// Every target at `level`.
    pub fn uniform(level: LevelFilter) -> Self {
        Self {
            default: level,
            compiler: level,
            vm: level,
            gc: level,
        }
    }

    fn targets(&self) -> Targets {
        Targets::new()
            .with_default(self.default)
            .with_target(COMPILER_TARGET, self.compiler)
            .with_target(VM_TARGET, self.vm)
            .with_target(GC_TARGET, self.gc)
    }
}

/// Install a stderr subscriber filtered by `levels`. Returns false if a
/// global subscriber was already set.
pub fn init(levels: LogLevels, format: LogFormat) -> bool {
    let layer = match format {
        LogFormat::Full => fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(levels.targets()))
        .try_init()
        .is_ok()
}

/// Install a stderr subscriber configured by `CORVID_LOG`, using
/// `EnvFilter` directive syntax (`corvid::gc=debug,warn`).
pub fn init_from_env() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Simple subscriber for tests, printing through the test harness.
#[cfg(test)]
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_levels() {
        assert_eq!(LogLevels::default().gc, LevelFilter::WARN);
        assert_eq!(LogLevels::uniform(LevelFilter::DEBUG).vm, LevelFilter::DEBUG);
        assert_eq!(LogFormat::default(), LogFormat::Full);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_test_logger();
        assert!(!init(LogLevels::default(), LogFormat::Compact));
        assert!(!init_from_env());
    }
}
