//! Process-wide logging configuration.
//!
//! The worker owns a reload-able filter so the control daemon can change
//! verbosity at runtime without restarting it: UPDATE_LOG moves the base
//! level, UPDATE_DEBUG_FLAGS lights up per-subsystem targets. Updates go
//! through [`LogHandle`] under its config lock.

use std::sync::RwLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::wire::protocol::{DebugFlags, LogLevel};

#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    pub level: LogLevel,
    pub debug_flags: DebugFlags,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            debug_flags: DebugFlags::default(),
        }
    }
}

/// Handle for mutating the installed filter.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    config: RwLock<LogConfig>,
}

/// Install the global subscriber and return the mutation handle.
///
/// Output goes to stderr; stdout stays clean in case the embedding daemon
/// uses it. Call once per process.
pub fn init(config: LogConfig) -> anyhow::Result<LogHandle> {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(directives(&config)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()?;

    Ok(LogHandle {
        reload: handle,
        config: RwLock::new(config),
    })
}

impl LogHandle {
    pub fn config(&self) -> LogConfig {
        *self.read_lock()
    }

    pub fn update_level(&self, level: LogLevel) {
        let updated = {
            let mut config = self.write_lock();
            config.level = level;
            *config
        };
        tracing::info!(level = level.as_str(), "Updating log level");
        self.apply(&updated);
    }

    pub fn update_debug_flags(&self, flags: DebugFlags) {
        let updated = {
            let mut config = self.write_lock();
            config.debug_flags = flags;
            *config
        };
        tracing::info!(flags = flags.0, "Updating debug flags");
        self.apply(&updated);
    }

    fn apply(&self, config: &LogConfig) {
        if let Err(e) = self.reload.reload(EnvFilter::new(directives(config))) {
            tracing::error!(error = %e, "Failed to reload log filter");
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, LogConfig> {
        match self.config.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, LogConfig> {
        match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Translate level + flags into filter directives. The base level applies
/// to this crate; flagged subsystems get their own elevated targets.
fn directives(config: &LogConfig) -> String {
    let mut parts = vec![format!("warn,scriptd={}", config.level.as_str())];

    let flags = config.debug_flags;
    if flags.contains(DebugFlags::SCRIPT) {
        parts.push("scriptd::runner=debug".to_string());
        parts.push("scriptd::daemon=debug".to_string());
    }
    if flags.contains(DebugFlags::POWER) {
        parts.push("scriptd::power=debug".to_string());
    }
    if flags.contains(DebugFlags::BURST_BUF) {
        parts.push("scriptd::bb=debug".to_string());
    }
    if flags.contains(DebugFlags::PROTOCOL) {
        parts.push("scriptd::wire=trace".to_string());
    }

    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_directive_tracks_level() {
        let config = LogConfig {
            level: LogLevel::Debug,
            debug_flags: DebugFlags::default(),
        };
        assert_eq!(directives(&config), "warn,scriptd=debug");
    }

    #[test]
    fn flags_add_subsystem_targets() {
        let config = LogConfig {
            level: LogLevel::Info,
            debug_flags: DebugFlags::POWER | DebugFlags::PROTOCOL,
        };
        let directives = directives(&config);
        assert!(directives.contains("scriptd::power=debug"));
        assert!(directives.contains("scriptd::wire=trace"));
        assert!(!directives.contains("scriptd::bb"));
    }

    #[test]
    fn directives_always_parse_as_a_filter() {
        let config = LogConfig {
            level: LogLevel::Trace,
            debug_flags: DebugFlags::SCRIPT
                | DebugFlags::POWER
                | DebugFlags::BURST_BUF
                | DebugFlags::PROTOCOL,
        };
        // EnvFilter::try_new rejects malformed directive strings.
        assert!(EnvFilter::try_new(directives(&config)).is_ok());
    }
}
