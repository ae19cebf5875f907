//! Control-side client for the script worker.
//!
//! The client owns the request pipe's writer (one mutex per direction so
//! concurrent senders never interleave partial frames) and a reader task
//! that routes keyed completions into the correlation registry. When the
//! response pipe dies the reader marks the connection dead and fails every
//! outstanding waiter, so callers never hang on a worker that is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bootstrap::{self, ReexecSpawner, ScriptdSpawner, WorkerOptions};
use crate::error::ScriptdError;
use crate::pending::PendingRequests;
use crate::wire::codec::MsgCodec;
use crate::wire::protocol::{DebugFlags, LogLevel, Msg, ScriptCompletion, ScriptRequest};

const DEFAULT_SHUTDOWN_BOUND: Duration = Duration::from_secs(30);

/// The coordinator surface the surrounding daemon consumes.
///
/// A trait so daemon logic can be tested against a mock without a worker
/// process behind it.
#[async_trait]
pub trait ScriptCoordinator: Send + Sync {
    /// Run a script and wait for its completion.
    async fn run_script(&self, request: ScriptRequest) -> Result<ScriptCompletion, ScriptdError>;

    /// Run a script without waiting for a reply.
    async fn run_script_detached(&self, request: ScriptRequest) -> Result<(), ScriptdError>;

    /// Kill every killable script and wait until the worker confirms the
    /// set has drained. Used for reconfigure; the worker keeps running.
    async fn flush(&self) -> Result<(), ScriptdError>;

    /// Kill the killable scripts of one job. Fire-and-forget.
    async fn flush_job(&self, job_id: u32) -> Result<(), ScriptdError>;

    async fn update_debug_flags(&self, flags: DebugFlags) -> Result<(), ScriptdError>;

    async fn update_log_level(&self, level: LogLevel) -> Result<(), ScriptdError>;

    /// Stop the worker. Best-effort notify, bounded wait, then force-kill
    /// and reap. Always returns in bounded time.
    async fn shutdown(&self) -> Result<(), ScriptdError>;
}

pub struct ClientConfig {
    pub worker: WorkerOptions,
    pub spawner: Arc<dyn ScriptdSpawner>,
    pub shutdown_bound: Duration,
}

impl ClientConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            worker: WorkerOptions {
                cluster_name: cluster_name.into(),
                ..WorkerOptions::default()
            },
            spawner: Arc::new(ReexecSpawner),
            shutdown_bound: DEFAULT_SHUTDOWN_BOUND,
        }
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.worker.log_level = level;
        self
    }

    pub fn with_debug_flags(mut self, flags: DebugFlags) -> Self {
        self.worker.debug_flags = flags;
        self
    }

    pub fn with_power_grace(mut self, grace: Duration) -> Self {
        self.worker.power_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ScriptdSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_shutdown_bound(mut self, bound: Duration) -> Self {
        self.shutdown_bound = bound;
        self
    }
}

type SharedWriter =
    Arc<tokio::sync::Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MsgCodec>>>;

pub struct ScriptdClient {
    writer: SharedWriter,
    pending: Arc<PendingRequests>,
    alive: watch::Receiver<bool>,
    child: tokio::sync::Mutex<Option<Child>>,
    shutdown_bound: Duration,
}

impl ScriptdClient {
    /// Spawn the worker process and complete the bootstrap handshake.
    pub async fn spawn(config: ClientConfig) -> Result<Self, ScriptdError> {
        let launched = bootstrap::launch_worker(&config.worker, config.spawner.as_ref()).await?;
        let mut client = Self::connect(launched.reader, launched.writer, Some(launched.child));
        client.shutdown_bound = config.shutdown_bound;
        Ok(client)
    }

    /// Attach to an already-established transport.
    ///
    /// Used by embedders that manage the worker process themselves and by
    /// tests running both ends in one process.
    pub fn connect<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(PendingRequests::new());
        let (alive_tx, alive_rx) = watch::channel(true);

        let reader = FramedRead::new(reader, MsgCodec::new());
        tokio::spawn(read_loop(reader, Arc::clone(&pending), alive_tx));

        Self {
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
                MsgCodec::new(),
            ))),
            pending,
            alive: alive_rx,
            child: tokio::sync::Mutex::new(child),
            shutdown_bound: DEFAULT_SHUTDOWN_BOUND,
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    async fn send(&self, msg: Msg) -> Result<(), ScriptdError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(msg)
            .await
            .map_err(|e| ScriptdError::Protocol(format!("failed to send request: {e}")))
    }
}

#[async_trait]
impl ScriptCoordinator for ScriptdClient {
    async fn run_script(&self, request: ScriptRequest) -> Result<ScriptCompletion, ScriptdError> {
        if !self.is_alive() {
            return Err(ScriptdError::WorkerGone);
        }

        let (key, rx) = self.pending.add();
        tracing::debug!(%key, job_id = request.job_id, name = %request.name, "Sending script request");

        if let Err(e) = self
            .send(Msg::RunScript {
                key: Some(key),
                request,
            })
            .await
        {
            self.pending.discard(key);
            return Err(e);
        }

        match rx.await {
            Ok(Some(completion)) => Ok(completion),
            Ok(None) => Err(ScriptdError::Protocol(
                "completion arrived without a body".to_string(),
            )),
            Err(_) => Err(ScriptdError::WorkerGone),
        }
    }

    async fn run_script_detached(&self, request: ScriptRequest) -> Result<(), ScriptdError> {
        if !self.is_alive() {
            return Err(ScriptdError::WorkerGone);
        }
        self.send(Msg::RunScript { key: None, request }).await
    }

    async fn flush(&self) -> Result<(), ScriptdError> {
        if !self.is_alive() {
            return Err(ScriptdError::WorkerGone);
        }

        let (key, rx) = self.pending.add();
        if let Err(e) = self.send(Msg::Flush { key: Some(key) }).await {
            self.pending.discard(key);
            return Err(e);
        }

        rx.await.map(|_| ()).map_err(|_| ScriptdError::WorkerGone)
    }

    async fn flush_job(&self, job_id: u32) -> Result<(), ScriptdError> {
        self.send(Msg::FlushJob { job_id }).await
    }

    async fn update_debug_flags(&self, flags: DebugFlags) -> Result<(), ScriptdError> {
        self.send(Msg::UpdateDebugFlags { flags }).await
    }

    async fn update_log_level(&self, level: LogLevel) -> Result<(), ScriptdError> {
        self.send(Msg::UpdateLog { level }).await
    }

    async fn shutdown(&self) -> Result<(), ScriptdError> {
        tracing::info!("Shutting down script worker");

        // An I/O failure here means the worker is already gone; fall
        // through to reaping either way.
        if let Err(e) = self.send(Msg::Shutdown).await {
            tracing::debug!(error = %e, "Shutdown send failed, treating worker as gone");
        }

        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            match tokio::time::timeout(self.shutdown_bound, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(?status, "Worker exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Failed waiting for worker, force-killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                Err(_) => {
                    tracing::warn!(
                        bound_secs = self.shutdown_bound.as_secs(),
                        "Worker did not exit within bound, force-killing"
                    );
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            *child_slot = None;
        }

        self.pending.fail_all();
        Ok(())
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, MsgCodec>,
    pending: Arc<PendingRequests>,
    alive: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(item) = reader.next().await {
        match item {
            Ok(Msg::ScriptComplete {
                key: Some(key),
                completion,
            }) => {
                pending.notify(key, completion);
            }
            Ok(Msg::ScriptComplete {
                key: None,
                completion,
            }) => {
                if let Some(c) = completion {
                    tracing::debug!(
                        job_id = c.job_id,
                        name = %c.name,
                        status = c.status,
                        "Unkeyed script completion"
                    );
                }
            }
            Ok(other) => {
                tracing::warn!(msg_type = ?other.msg_type(), "Unexpected message from worker");
            }
            Err(e) => {
                tracing::error!(error = %e, "Response pipe error");
                break;
            }
        }
    }

    tracing::info!("Response pipe closed, failing pending requests");
    let _ = alive.send(false);
    pending.fail_all();
}
