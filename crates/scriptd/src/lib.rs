//! scriptd: script-execution coordinator for the cluster control daemon.
//!
//! The control daemon delegates every external script (prolog, epilog,
//! node power resume/suspend, burst-buffer hooks, mail, reboot,
//! reservation) to a dedicated worker process, isolating itself from
//! script crashes and hangs. The two processes speak a framed binary
//! protocol over a pair of pipes with key-correlated request/response
//! matching.
//!
//! Embedding: call [`run_if_worker`] first thing in `main` (the worker is
//! this same binary re-exec'd with a mode marker), then
//! [`ScriptdClient::spawn`] to bring the worker up.

mod envspec;
mod error;
mod pending;
mod registry;
mod runner;
mod shutdown;

pub mod bootstrap;
pub mod client;
pub mod daemon;
pub mod logging;
pub mod wire;

pub use bootstrap::{ReexecSpawner, ScriptdSpawner, SpawnContext, WorkerOptions};
pub use client::{ClientConfig, ScriptCoordinator, ScriptdClient};
pub use daemon::{DaemonConfig, worker_main};
pub use error::ScriptdError;
pub use logging::{LogConfig, LogHandle};
pub use runner::{RunOutcome, STATUS_SPAWN_FAILED, STATUS_TIMEOUT};
pub use shutdown::DEFAULT_POWER_GRACE;
pub use wire::protocol::{
    DebugFlags, LogLevel, Msg, MsgType, RequestKey, ScriptCategory, ScriptCompletion,
    ScriptRequest,
};

/// Take the worker path when this process is the re-exec'd worker.
///
/// Returns `None` in the control daemon (continue normal startup) and
/// `Some(result)` after running the worker to completion; the caller
/// should exit with it.
pub fn run_if_worker() -> Option<anyhow::Result<()>> {
    bootstrap::is_worker_invocation().then(daemon::worker_main)
}
