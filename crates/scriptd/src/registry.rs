//! Running-script registry.
//!
//! Tracks every in-flight script so flush and shutdown can reach it.
//! Killable scripts carry a cancellation token; power scripts carry none:
//! they are tracked only through a separate live counter so no kill path
//! can touch them. Registration hands back an RAII guard; dropping the
//! guard deregisters the script and decrements the right counter, so every
//! exit path of a script task releases its entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::wire::protocol::ScriptCategory;

#[derive(Debug)]
struct Entry {
    job_id: u32,
    name: String,
    category: ScriptCategory,
    /// `None` for power scripts: excluded from every kill path.
    cancel: Option<CancellationToken>,
}

pub struct RunningScripts {
    scripts: DashMap<u64, Entry>,
    next_id: AtomicU64,
    killable: watch::Sender<usize>,
    power: watch::Sender<usize>,
}

impl RunningScripts {
    pub fn new() -> Arc<Self> {
        let (killable, _) = watch::channel(0);
        let (power, _) = watch::channel(0);
        Arc::new(Self {
            scripts: DashMap::new(),
            next_id: AtomicU64::new(1),
            killable,
            power,
        })
    }

    /// Register a starting script. The returned guard deregisters on drop;
    /// its token is the script's kill signal (never fired for power).
    pub fn register(
        self: &Arc<Self>,
        job_id: u32,
        name: &str,
        category: ScriptCategory,
    ) -> ScriptGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let entry = Entry {
            job_id,
            name: name.to_string(),
            category,
            cancel: category.is_killable().then(|| token.clone()),
        };
        self.scripts.insert(id, entry);

        if category.is_killable() {
            self.killable.send_modify(|c| *c += 1);
        } else {
            self.power.send_modify(|c| *c += 1);
        }

        tracing::debug!(job_id, name, %category, "Registered script");

        ScriptGuard {
            registry: Arc::clone(self),
            id,
            category,
            token,
        }
    }

    fn deregister(&self, id: u64, category: ScriptCategory) {
        if self.scripts.remove(&id).is_some() {
            if category.is_killable() {
                self.killable.send_modify(|c| *c = c.saturating_sub(1));
            } else {
                self.power.send_modify(|c| *c = c.saturating_sub(1));
            }
        }
    }

    /// Cancel every killable script tied to one job. Best-effort: the
    /// token kills the child process, the task still runs to reap it.
    pub fn cancel_job(&self, job_id: u32) -> usize {
        let mut cancelled = 0;
        for entry in self.scripts.iter() {
            if entry.job_id == job_id
                && let Some(token) = &entry.cancel
            {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(job_id, cancelled, "Cancelled scripts for job");
        }
        cancelled
    }

    /// Cancel every killable script. Power scripts are untouched.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.scripts.iter() {
            if let Some(token) = &entry.cancel {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled all killable scripts");
        }
        cancelled
    }

    pub fn killable_count(&self) -> usize {
        *self.killable.borrow()
    }

    pub fn power_count(&self) -> usize {
        *self.power.borrow()
    }

    /// Snapshot of live power scripts, for orphan reporting.
    pub fn power_scripts(&self) -> Vec<(u32, String)> {
        self.scripts
            .iter()
            .filter(|e| !e.category.is_killable())
            .map(|e| (e.job_id, e.name.clone()))
            .collect()
    }

    /// Wait until no killable script remains, up to `bound`. Returns
    /// whether the set drained.
    pub async fn wait_killable_drained(&self, bound: Duration) -> bool {
        Self::wait_drained(self.killable.subscribe(), bound).await
    }

    /// Wait until no power script remains, up to `bound`. Returns whether
    /// the count reached zero.
    pub async fn wait_power_drained(&self, bound: Duration) -> bool {
        Self::wait_drained(self.power.subscribe(), bound).await
    }

    async fn wait_drained(mut rx: watch::Receiver<usize>, bound: Duration) -> bool {
        tokio::time::timeout(bound, rx.wait_for(|c| *c == 0))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// RAII registration for one running script.
pub struct ScriptGuard {
    registry: Arc<RunningScripts>,
    id: u64,
    category: ScriptCategory,
    token: CancellationToken,
}

impl ScriptGuard {
    /// The script's kill signal. For power scripts this token exists but
    /// nothing in the registry ever cancels it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ScriptGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id, self.category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_drop_deregisters() {
        let registry = RunningScripts::new();
        let guard = registry.register(1, "prolog", ScriptCategory::Prolog);
        assert_eq!(registry.killable_count(), 1);
        drop(guard);
        assert_eq!(registry.killable_count(), 0);
    }

    #[tokio::test]
    async fn power_scripts_counted_separately_and_never_cancelled() {
        let registry = RunningScripts::new();
        let power = registry.register(2, "ResumeProgram", ScriptCategory::Power);
        let prolog = registry.register(3, "prolog", ScriptCategory::Prolog);

        assert_eq!(registry.power_count(), 1);
        assert_eq!(registry.killable_count(), 1);

        assert_eq!(registry.cancel_all(), 1);
        assert!(prolog.token().is_cancelled());
        assert!(!power.token().is_cancelled());

        let live = registry.power_scripts();
        assert_eq!(live, vec![(2, "ResumeProgram".to_string())]);
    }

    #[tokio::test]
    async fn cancel_job_only_touches_matching_job() {
        let registry = RunningScripts::new();
        let a = registry.register(10, "epilog", ScriptCategory::Epilog);
        let b = registry.register(11, "epilog", ScriptCategory::Epilog);

        assert_eq!(registry.cancel_job(10), 1);
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
    }

    #[tokio::test]
    async fn wait_power_drained_times_out_then_succeeds() {
        let registry = RunningScripts::new();
        let guard = registry.register(4, "SuspendProgram", ScriptCategory::Power);

        assert!(!registry.wait_power_drained(Duration::from_millis(50)).await);

        let registry2 = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            registry2.wait_power_drained(Duration::from_secs(5)).await
        });
        drop(guard);
        assert!(waiter.await.unwrap());
    }
}
