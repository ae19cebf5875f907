//! Error taxonomy for the coordinator.
//!
//! Script-level failures (nonzero exit, signal, timeout) are never errors:
//! they travel as data in `ScriptCompletion`. Errors here are the process
//! and transport level failures the caller has to react to.

#[derive(Debug, thiserror::Error)]
pub enum ScriptdError {
    /// Fork/exec of the worker failed. Fatal: nothing is running.
    #[error("failed to launch script worker: {0}")]
    Spawn(String),

    /// The worker came up but the bootstrap handshake failed or timed out.
    /// Fatal: the worker cannot be trusted to be alive.
    #[error("script worker handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be written or was malformed. The connection is
    /// torn down; no retry.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker process or its pipes are gone. Pending waits fail fast
    /// with this instead of hanging.
    #[error("script worker is gone")]
    WorkerGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
