//! Worker process bootstrap.
//!
//! The control daemon creates two anonymous pipes and re-execs its own
//! binary with a mode-marker argument; the child finds the request pipe's
//! read end on fd 3 and the response pipe's write end on fd 4. Before any
//! framing starts, three raw big-endian sentinel integers cross the pipes:
//! the parent writes HELLO, the child answers ACK, and once the child has
//! finished initializing it writes READY. A wrong value, a short
//! read, or a timeout is a fatal bootstrap error: it happens before the
//! worker can be trusted to be alive, so the parent kills and reaps it.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::time::Duration;

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd::dup2;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::error::ScriptdError;
use crate::shutdown::DEFAULT_POWER_GRACE;
use crate::wire::protocol::{DebugFlags, LogLevel};

/// Mode marker: `argv[1]` of the re-exec'd worker process.
pub const WORKER_MODE_ARG: &str = "slurmscriptd";

/// Fixed descriptors the spawner installs before exec.
pub const WORKER_REQUEST_FD: RawFd = 3;
pub const WORKER_RESPONSE_FD: RawFd = 4;

/// Scratch range used while shuffling fds in the child, clear of 0-4.
const HIGH_FD_BASE: RawFd = 10;

const HANDSHAKE_HELLO: i32 = 0x5343_5201;
const HANDSHAKE_ACK: i32 = 0x5343_5202;
const HANDSHAKE_READY: i32 = 0x5343_5203;

const HANDSHAKE_BOUND: Duration = Duration::from_secs(10);

pub const ENV_CLUSTER_NAME: &str = "SCRIPTD_CLUSTER_NAME";
pub const ENV_LOG_LEVEL: &str = "SCRIPTD_LOG_LEVEL";
pub const ENV_DEBUG_FLAGS: &str = "SCRIPTD_DEBUG_FLAGS";
pub const ENV_POWER_GRACE: &str = "SCRIPTD_POWER_GRACE_SECS";

/// Options the worker needs before it can read its first frame, carried
/// across the exec boundary in the environment.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub cluster_name: String,
    pub log_level: LogLevel,
    pub debug_flags: DebugFlags,
    pub power_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            cluster_name: "cluster".to_string(),
            log_level: LogLevel::Info,
            debug_flags: DebugFlags::default(),
            power_grace: DEFAULT_POWER_GRACE,
        }
    }
}

impl WorkerOptions {
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_CLUSTER_NAME.to_string(), self.cluster_name.clone()),
            (
                ENV_LOG_LEVEL.to_string(),
                self.log_level.as_str().to_string(),
            ),
            (ENV_DEBUG_FLAGS.to_string(), self.debug_flags.0.to_string()),
            (
                ENV_POWER_GRACE.to_string(),
                self.power_grace.as_secs().to_string(),
            ),
        ]
    }

    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Parse options from a variable lookup; anything absent or malformed
    /// falls back to the default.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            cluster_name: lookup(ENV_CLUSTER_NAME).unwrap_or(defaults.cluster_name),
            log_level: lookup(ENV_LOG_LEVEL)
                .and_then(|v| LogLevel::parse(&v))
                .unwrap_or(defaults.log_level),
            debug_flags: lookup(ENV_DEBUG_FLAGS)
                .and_then(|v| v.parse::<u64>().ok())
                .map(DebugFlags)
                .unwrap_or(defaults.debug_flags),
            power_grace: lookup(ENV_POWER_GRACE)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.power_grace),
        }
    }
}

/// Everything a spawner needs: the two pipe ends destined for the child
/// and the environment to carry across exec.
pub struct SpawnContext {
    pub request_read: OwnedFd,
    pub response_write: OwnedFd,
    pub env: Vec<(String, String)>,
}

/// Extension point for how the worker process comes to exist.
pub trait ScriptdSpawner: Send + Sync {
    fn spawn(&self, ctx: &SpawnContext) -> Result<Child, ScriptdError>;
}

/// Default spawner: re-exec the current executable with the mode marker.
///
/// The embedding daemon must call [`run_if_worker`](crate::run_if_worker)
/// early in `main` so the re-exec'd copy takes the worker path.
pub struct ReexecSpawner;

impl ScriptdSpawner for ReexecSpawner {
    fn spawn(&self, ctx: &SpawnContext) -> Result<Child, ScriptdError> {
        let exe = std::env::current_exe()
            .map_err(|e| ScriptdError::Spawn(format!("current_exe failed: {e}")))?;

        let request_fd = ctx.request_read.as_raw_fd();
        let response_fd = ctx.response_write.as_raw_fd();

        let mut cmd = Command::new(exe);
        cmd.arg(WORKER_MODE_ARG)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        // Safety: the closure runs between fork and exec and only performs
        // dup2/fcntl, which are async-signal-safe. The raw fds are pipe
        // ends owned by SpawnContext, alive until after spawn returns.
        unsafe {
            cmd.pre_exec(move || install_worker_fds(request_fd, response_fd));
        }

        cmd.spawn()
            .map_err(|e| ScriptdError::Spawn(format!("failed to exec worker: {e}")))
    }
}

/// Install the pipe ends at the fixed descriptors (child side, pre-exec).
///
/// Both ends are first duplicated clear of the target range so the second
/// dup2 cannot clobber the first when the inherited fds happen to land on
/// 3 or 4. dup2 clears FD_CLOEXEC on the targets; the inherited originals
/// keep theirs and vanish at exec.
fn install_worker_fds(request_fd: RawFd, response_fd: RawFd) -> io::Result<()> {
    // Safety: borrowing fds inherited across fork; both are open pipe ends.
    let request = unsafe { BorrowedFd::borrow_raw(request_fd) };
    let response = unsafe { BorrowedFd::borrow_raw(response_fd) };

    let request_tmp = fcntl(request, FcntlArg::F_DUPFD(HIGH_FD_BASE)).map_err(io::Error::from)?;
    let response_tmp =
        fcntl(response, FcntlArg::F_DUPFD(HIGH_FD_BASE)).map_err(io::Error::from)?;

    // Safety: F_DUPFD just handed us these descriptors; nothing else owns
    // them.
    let request_tmp = unsafe { OwnedFd::from_raw_fd(request_tmp) };
    let response_tmp = unsafe { OwnedFd::from_raw_fd(response_tmp) };

    // Safety: fds 3/4 are either closed or about to be replaced; the
    // OwnedFd is forgotten so nothing closes the installed descriptor.
    let mut request_target = unsafe { OwnedFd::from_raw_fd(WORKER_REQUEST_FD) };
    dup2(&request_tmp, &mut request_target).map_err(io::Error::from)?;
    std::mem::forget(request_target);

    let mut response_target = unsafe { OwnedFd::from_raw_fd(WORKER_RESPONSE_FD) };
    dup2(&response_tmp, &mut response_target).map_err(io::Error::from)?;
    std::mem::forget(response_target);

    // Temps close here; targets stay.
    Ok(())
}

/// Whether this process was invoked as the worker.
pub fn is_worker_invocation() -> bool {
    std::env::args().nth(1).as_deref() == Some(WORKER_MODE_ARG)
}

/// Adopt the fixed descriptors as the worker's transport.
///
/// Call once, inside the runtime. The descriptors are marked close-on-exec
/// so script children do not inherit the control pipes.
pub fn worker_transport() -> io::Result<(pipe::Receiver, pipe::Sender)> {
    // Safety: the spawner installed the pipe ends at these descriptors
    // before exec and nothing else in this process owns them.
    let read_fd = unsafe { OwnedFd::from_raw_fd(WORKER_REQUEST_FD) };
    let write_fd = unsafe { OwnedFd::from_raw_fd(WORKER_RESPONSE_FD) };

    for fd in [&read_fd, &write_fd] {
        set_cloexec(fd)?;
        set_nonblocking(fd)?;
    }

    let reader = pipe::Receiver::from_owned_fd(read_fd)?;
    let writer = pipe::Sender::from_owned_fd(write_fd)?;
    Ok((reader, writer))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(io::Error::from)?;
    let flags = FdFlag::from_bits_retain(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// A spawned, handshaken worker ready for framing.
pub struct LaunchedWorker {
    pub child: Child,
    pub writer: pipe::Sender,
    pub reader: pipe::Receiver,
}

/// Create the pipes, spawn the worker, and complete the handshake.
pub async fn launch_worker(
    options: &WorkerOptions,
    spawner: &dyn ScriptdSpawner,
) -> Result<LaunchedWorker, ScriptdError> {
    let (request_read, request_write) =
        io::pipe().map_err(|e| ScriptdError::Spawn(format!("request pipe: {e}")))?;
    let (response_read, response_write) =
        io::pipe().map_err(|e| ScriptdError::Spawn(format!("response pipe: {e}")))?;

    let ctx = SpawnContext {
        request_read: request_read.into(),
        response_write: response_write.into(),
        env: options.to_env(),
    };

    tracing::info!(cluster = %options.cluster_name, "Spawning script worker");
    let mut child = spawner.spawn(&ctx)?;
    // Close the child's ends in this process so EOF propagates when the
    // worker dies.
    drop(ctx);

    let writer_fd: OwnedFd = request_write.into();
    let reader_fd: OwnedFd = response_read.into();
    let transport = (|| -> io::Result<(pipe::Sender, pipe::Receiver)> {
        set_nonblocking(&writer_fd)?;
        set_nonblocking(&reader_fd)?;
        Ok((
            pipe::Sender::from_owned_fd(writer_fd)?,
            pipe::Receiver::from_owned_fd(reader_fd)?,
        ))
    })();

    let (mut writer, mut reader) = match transport {
        Ok(t) => t,
        Err(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ScriptdError::Spawn(format!("pipe setup: {e}")));
        }
    };

    if let Err(e) = parent_handshake(&mut writer, &mut reader).await {
        tracing::error!(error = %e, "Worker handshake failed, killing worker");
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(e);
    }

    tracing::debug!("Worker handshake complete");
    Ok(LaunchedWorker {
        child,
        writer,
        reader,
    })
}

/// Parent half of the handshake: HELLO out, ACK and READY back, bounded.
pub async fn parent_handshake<W, R>(tx: &mut W, rx: &mut R) -> Result<(), ScriptdError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    tx.write_i32(HANDSHAKE_HELLO)
        .await
        .map_err(|e| ScriptdError::Handshake(format!("failed to send hello: {e}")))?;
    tx.flush()
        .await
        .map_err(|e| ScriptdError::Handshake(format!("failed to flush hello: {e}")))?;

    let ack = read_sentinel(rx, "ack").await?;
    if ack != HANDSHAKE_ACK {
        return Err(ScriptdError::Handshake(format!(
            "unexpected ack value {ack:#010x}"
        )));
    }

    let ready = read_sentinel(rx, "ready").await?;
    if ready != HANDSHAKE_READY {
        return Err(ScriptdError::Handshake(format!(
            "unexpected ready value {ready:#010x}"
        )));
    }

    Ok(())
}

async fn read_sentinel<R>(rx: &mut R, what: &str) -> Result<i32, ScriptdError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(HANDSHAKE_BOUND, rx.read_i32()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ScriptdError::Handshake(format!(
            "failed to read {what}: {e}"
        ))),
        Err(_) => Err(ScriptdError::Handshake(format!(
            "timed out waiting for {what}"
        ))),
    }
}

/// Worker half, step one: validate HELLO and answer ACK.
pub async fn worker_acknowledge<R, W>(rx: &mut R, tx: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = rx.read_i32().await?;
    if hello != HANDSHAKE_HELLO {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected hello value {hello:#010x}"),
        ));
    }
    tx.write_i32(HANDSHAKE_ACK).await?;
    tx.flush().await
}

/// Worker half, step two: initialization is done, release the parent.
pub async fn worker_signal_ready<W>(tx: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    tx.write_i32(HANDSHAKE_READY).await?;
    tx.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_options_roundtrip_through_env() {
        let options = WorkerOptions {
            cluster_name: "tux".to_string(),
            log_level: LogLevel::Debug,
            debug_flags: DebugFlags::POWER,
            power_grace: Duration::from_secs(30),
        };

        let env = options.to_env();
        let parsed = WorkerOptions::from_vars(|key| {
            env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        });

        assert_eq!(parsed.cluster_name, "tux");
        assert_eq!(parsed.log_level, LogLevel::Debug);
        assert_eq!(parsed.debug_flags, DebugFlags::POWER);
        assert_eq!(parsed.power_grace, Duration::from_secs(30));
    }

    #[test]
    fn malformed_env_falls_back_to_defaults() {
        let parsed = WorkerOptions::from_vars(|key| match key {
            ENV_DEBUG_FLAGS => Some("not-a-number".to_string()),
            ENV_LOG_LEVEL => Some("loud".to_string()),
            _ => None,
        });
        assert_eq!(parsed.log_level, LogLevel::Info);
        assert!(parsed.debug_flags.is_empty());
        assert_eq!(parsed.power_grace, DEFAULT_POWER_GRACE);
    }

    #[tokio::test]
    async fn handshake_completes_over_duplex() {
        let (parent_side, worker_side) = tokio::io::duplex(64);
        let (mut parent_rx, mut parent_tx) = tokio::io::split(parent_side);
        let (mut worker_rx, mut worker_tx) = tokio::io::split(worker_side);

        let worker = tokio::spawn(async move {
            worker_acknowledge(&mut worker_rx, &mut worker_tx).await?;
            worker_signal_ready(&mut worker_tx).await
        });

        parent_handshake(&mut parent_tx, &mut parent_rx)
            .await
            .unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_sentinel() {
        let (parent_side, worker_side) = tokio::io::duplex(64);
        let (mut parent_rx, mut parent_tx) = tokio::io::split(parent_side);
        let (mut worker_rx, mut worker_tx) = tokio::io::split(worker_side);

        tokio::spawn(async move {
            // Swallow the hello, answer garbage.
            let _ = worker_rx.read_i32().await;
            let _ = worker_tx.write_i32(0x0bad_f00d).await;
        });

        let err = parent_handshake(&mut parent_tx, &mut parent_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptdError::Handshake(_)));
    }

    #[tokio::test]
    async fn worker_rejects_wrong_hello() {
        let (parent_side, worker_side) = tokio::io::duplex(64);
        let (_parent_rx, mut parent_tx) = tokio::io::split(parent_side);
        let (mut worker_rx, mut worker_tx) = tokio::io::split(worker_side);

        parent_tx.write_i32(0x0bad_f00d).await.unwrap();

        let err = worker_acknowledge(&mut worker_rx, &mut worker_tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
