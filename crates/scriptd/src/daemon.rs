//! Worker-side reactor and request dispatcher.
//!
//! One framed read loop per process; every script runs on its own spawned
//! task so the reactor is never blocked by script duration. SHUTDOWN, a
//! read error, and EOF all funnel into the same shutdown coordinator, so
//! ordinary control-daemon death takes the same path as an explicit
//! shutdown.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bootstrap::{self, WorkerOptions};
use crate::envspec;
use crate::logging::{self, LogConfig, LogHandle};
use crate::registry::RunningScripts;
use crate::runner::{self, RunOutcome, STATUS_SPAWN_FAILED};
use crate::shutdown::{DEFAULT_POWER_GRACE, ShutdownCoordinator};
use crate::wire::codec::MsgCodec;
use crate::wire::protocol::{Msg, RequestKey, ScriptCompletion, ScriptRequest};

/// Bound on waiting for killed scripts to drain during a flush.
const FLUSH_DRAIN_BOUND: Duration = Duration::from_secs(30);

type SharedWriter =
    Arc<tokio::sync::Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MsgCodec>>>;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub cluster_name: String,
    pub power_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cluster_name: "cluster".to_string(),
            power_grace: DEFAULT_POWER_GRACE,
        }
    }
}

impl From<&WorkerOptions> for DaemonConfig {
    fn from(options: &WorkerOptions) -> Self {
        Self {
            cluster_name: options.cluster_name.clone(),
            power_grace: options.power_grace,
        }
    }
}

#[derive(Clone)]
struct HandlerCtx {
    writer: SharedWriter,
    registry: Arc<RunningScripts>,
    cluster_name: Arc<str>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Run the worker event loop over an established transport.
///
/// Returns after the shutdown sequence has completed, whether triggered by
/// SHUTDOWN or by the request pipe going away.
pub async fn run<R, W>(
    reader: R,
    writer: W,
    config: DaemonConfig,
    log: Option<Arc<LogHandle>>,
) -> io::Result<()>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = FramedRead::new(reader, MsgCodec::new());
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
        MsgCodec::new(),
    )));

    let registry = RunningScripts::new();
    let coordinator = ShutdownCoordinator::new();
    let draining = Arc::new(AtomicBool::new(false));
    let mut tasks: JoinSet<()> = JoinSet::new();

    let ctx = HandlerCtx {
        writer: Arc::clone(&writer),
        registry: Arc::clone(&registry),
        cluster_name: config.cluster_name.clone().into(),
    };

    tracing::info!(cluster = %config.cluster_name, "Script worker ready");

    loop {
        tokio::select! {
            biased;

            msg = reader.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if dispatch(msg, &ctx, &mut tasks, &draining, log.as_deref()).await
                            == Flow::Shutdown
                        {
                            tracing::info!("Shutdown requested");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Request pipe error, shutting down");
                        break;
                    }
                    None => {
                        tracing::info!("Request pipe closed, shutting down");
                        break;
                    }
                }
            }

            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Script handler panicked");
                }
            }
        }
    }

    draining.store(true, Ordering::SeqCst);
    coordinator.run(&registry, config.power_grace).await;

    // Handlers whose scripts were just killed finish here; handlers of
    // orphaned power scripts are abandoned along with their children.
    while tasks.try_join_next().is_some() {}
    tasks.detach_all();

    tracing::info!("Script worker exiting");
    Ok(())
}

async fn dispatch(
    msg: Msg,
    ctx: &HandlerCtx,
    tasks: &mut JoinSet<()>,
    draining: &Arc<AtomicBool>,
    log: Option<&LogHandle>,
) -> Flow {
    match msg {
        Msg::RunScript { key, request } => {
            if draining.load(Ordering::SeqCst) {
                tracing::warn!(
                    job_id = request.job_id,
                    name = %request.name,
                    "Rejecting script during shutdown"
                );
                if key.is_some() {
                    let completion = rejection_completion(&request);
                    send_completion(&ctx.writer, key, Some(completion)).await;
                }
            } else {
                let ctx = ctx.clone();
                tasks.spawn(async move { handle_run_script(ctx, key, request).await });
            }
            Flow::Continue
        }

        Msg::Flush { key } => {
            tracing::info!("Flush requested, killing all killable scripts");
            ctx.registry.cancel_all();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                if !ctx.registry.wait_killable_drained(FLUSH_DRAIN_BOUND).await {
                    tracing::warn!(
                        remaining = ctx.registry.killable_count(),
                        "Flush did not drain within bound"
                    );
                }
                if key.is_some() {
                    send_completion(&ctx.writer, key, None).await;
                }
            });
            Flow::Continue
        }

        Msg::FlushJob { job_id } => {
            ctx.registry.cancel_job(job_id);
            Flow::Continue
        }

        Msg::UpdateDebugFlags { flags } => {
            match log {
                Some(log) => log.update_debug_flags(flags),
                None => tracing::debug!(flags = flags.0, "No log handle, ignoring flag update"),
            }
            Flow::Continue
        }

        Msg::UpdateLog { level } => {
            match log {
                Some(log) => log.update_level(level),
                None => {
                    tracing::debug!(level = level.as_str(), "No log handle, ignoring level update")
                }
            }
            Flow::Continue
        }

        Msg::Shutdown => Flow::Shutdown,

        Msg::ScriptComplete { key, .. } => {
            tracing::warn!(?key, "Unexpected ScriptComplete on worker side, dropping");
            Flow::Continue
        }
    }
}

async fn handle_run_script(ctx: HandlerCtx, key: Option<RequestKey>, request: ScriptRequest) {
    let completion = execute(&ctx, &request).await;

    if request.category.is_killable() {
        tracing::debug!(
            job_id = request.job_id,
            name = %request.name,
            status = completion.status,
            timed_out = completion.timed_out,
            signalled = completion.signalled,
            "Script finished"
        );
    } else {
        tracing::info!(
            target: "scriptd::power",
            job_id = request.job_id,
            name = %request.name,
            status = completion.status,
            "Power script finished"
        );
    }

    if key.is_some() {
        send_completion(&ctx.writer, key, Some(completion)).await;
    }
}

async fn execute(ctx: &HandlerCtx, request: &ScriptRequest) -> ScriptCompletion {
    let prepared = match envspec::prepare(request, &ctx.cluster_name) {
        Ok(prepared) => prepared,
        Err(e) => {
            return failure_completion(
                request,
                format!("failed to prepare script environment: {e}"),
            );
        }
    };

    let guard = ctx
        .registry
        .register(request.job_id, &request.name, request.category);

    let outcome = runner::run_script(
        &request.path,
        &prepared.argv,
        &prepared.env,
        request.timeout(),
        guard.token(),
    )
    .await;

    drop(guard);
    drop(prepared);

    match outcome {
        Ok(outcome) => completion_for(request, outcome),
        Err(e) => {
            tracing::warn!(
                job_id = request.job_id,
                path = %request.path.display(),
                error = %e,
                "Failed to spawn script"
            );
            failure_completion(request, format!("failed to run {}: {e}", request.path.display()))
        }
    }
}

fn completion_for(request: &ScriptRequest, outcome: RunOutcome) -> ScriptCompletion {
    ScriptCompletion {
        job_id: request.job_id,
        name: request.name.clone(),
        category: request.category,
        status: outcome.status,
        signalled: outcome.signalled(),
        timed_out: outcome.timed_out,
        resp_msg: outcome.output,
    }
}

fn failure_completion(request: &ScriptRequest, resp_msg: String) -> ScriptCompletion {
    ScriptCompletion {
        job_id: request.job_id,
        name: request.name.clone(),
        category: request.category,
        status: STATUS_SPAWN_FAILED,
        signalled: false,
        timed_out: false,
        resp_msg,
    }
}

fn rejection_completion(request: &ScriptRequest) -> ScriptCompletion {
    ScriptCompletion {
        job_id: request.job_id,
        name: request.name.clone(),
        category: request.category,
        status: 1,
        signalled: false,
        timed_out: false,
        resp_msg: "script worker is shutting down".to_string(),
    }
}

async fn send_completion(
    writer: &SharedWriter,
    key: Option<RequestKey>,
    completion: Option<ScriptCompletion>,
) {
    let mut w = writer.lock().await;
    if let Err(e) = w.send(Msg::ScriptComplete { key, completion }).await {
        tracing::warn!(error = %e, "Failed to send completion (control side gone?)");
    }
}

/// Entry point for the re-exec'd worker process.
///
/// Adopts the fixed descriptors, completes the handshake, installs
/// logging, and runs the event loop to completion.
pub fn worker_main() -> anyhow::Result<()> {
    let options = WorkerOptions::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (mut reader, mut writer) = bootstrap::worker_transport()?;
        bootstrap::worker_acknowledge(&mut reader, &mut writer).await?;

        let log = Arc::new(logging::init(LogConfig {
            level: options.log_level,
            debug_flags: options.debug_flags,
        })?);

        bootstrap::worker_signal_ready(&mut writer).await?;

        run(reader, writer, DaemonConfig::from(&options), Some(log)).await?;
        anyhow::Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::protocol::ScriptCategory;
    use std::path::PathBuf;

    fn request() -> ScriptRequest {
        ScriptRequest {
            job_id: 9,
            name: "epilog".to_string(),
            category: ScriptCategory::Epilog,
            path: PathBuf::from("/bin/true"),
            argv: Vec::new(),
            env: Vec::new(),
            timeout_secs: None,
            extra: None,
        }
    }

    #[test]
    fn completion_keeps_runner_classification() {
        let outcome = RunOutcome {
            status: 137,
            output: "killed\n".to_string(),
            timed_out: false,
            signal: Some(9),
        };
        let completion = completion_for(&request(), outcome);
        assert_eq!(completion.status, 137);
        assert!(completion.signalled);
        assert!(!completion.timed_out);
        assert_eq!(completion.resp_msg, "killed\n");
    }

    #[test]
    fn spawn_failure_reports_status_127() {
        let completion = failure_completion(&request(), "no such file".to_string());
        assert_eq!(completion.status, STATUS_SPAWN_FAILED);
        assert!(!completion.signalled);
        assert!(!completion.timed_out);
    }
}
