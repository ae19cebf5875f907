//! Shutdown coordinator for the worker side.
//!
//! Power scripts get a bounded grace period to finish; whatever is still
//! running past the bound is deliberately orphaned; a kill signal is
//! never sent to a power script, since interrupting a node resume/suspend
//! can leave hardware state inconsistent. Everything else is killed
//! immediately and reaped within a bound.
//!
//! The coordinator is single-shot: the SHUTDOWN message and the
//! pipe-closed path both funnel here, and whichever arrives second is a
//! no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::registry::RunningScripts;

/// Default grace period for in-flight power scripts.
pub const DEFAULT_POWER_GRACE: Duration = Duration::from_secs(10);

/// Bound on reaping killed scripts before the coordinator gives up on
/// their completions.
const KILL_DRAIN_BOUND: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False when a previous invocation already ran the sequence.
    pub ran: bool,
    /// Whether every power script finished inside the grace period.
    pub power_drained: bool,
    /// Number of power scripts left running, unmanaged.
    pub orphaned: usize,
}

impl ShutdownReport {
    fn already_done() -> Self {
        Self {
            ran: false,
            power_drained: true,
            orphaned: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    done: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the shutdown sequence once. Subsequent calls return immediately.
    pub async fn run(&self, registry: &Arc<RunningScripts>, grace: Duration) -> ShutdownReport {
        if self.done.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already performed");
            return ShutdownReport::already_done();
        }

        let power_live = registry.power_count();
        let power_drained = if power_live == 0 {
            true
        } else {
            tracing::info!(
                target: "scriptd::power",
                running = power_live,
                grace_secs = grace.as_secs(),
                "Waiting for power scripts before shutdown"
            );
            registry.wait_power_drained(grace).await
        };

        let mut orphaned = 0;
        if !power_drained {
            for (job_id, name) in registry.power_scripts() {
                tracing::warn!(
                    target: "scriptd::power",
                    job_id,
                    name,
                    "Orphaning power script still running at shutdown"
                );
                orphaned += 1;
            }
        }

        let killed = registry.cancel_all();
        if killed > 0 && !registry.wait_killable_drained(KILL_DRAIN_BOUND).await {
            tracing::warn!(
                remaining = registry.killable_count(),
                "Killed scripts not reaped within bound"
            );
        }

        tracing::info!(orphaned, killed, "Shutdown sequence complete");

        ShutdownReport {
            ran: true,
            power_drained,
            orphaned,
        }
    }
}
