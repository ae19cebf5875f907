//! Script runner: spawn a child process, enforce a timeout, capture
//! combined output, classify the exit.
//!
//! Both stdout and stderr of the child are wired to the write end of a
//! single pipe so interleaving is preserved; a blocking task drains the
//! read end. The child runs in its own process group and force-kill
//! signals the whole group, so shell wrappers cannot leave grandchildren
//! behind.
//!
//! Classification priority: timed_out > signalled > exit status.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, pipe};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Reported status when the run hit its timeout.
pub const STATUS_TIMEOUT: i32 = 124;
/// Reported status when the script could not be spawned at all.
pub const STATUS_SPAWN_FAILED: i32 = 127;

/// Bound on draining captured output after the child is gone. A grandchild
/// holding the pipe open must not wedge the runner.
const OUTPUT_DRAIN_BOUND: Duration = Duration::from_secs(5);

/// Result of one script run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Exit code on normal exit, `128 + signo` when signalled,
    /// [`STATUS_TIMEOUT`] when the timeout fired.
    pub status: i32,
    /// Combined stdout+stderr.
    pub output: String,
    pub timed_out: bool,
    pub signal: Option<i32>,
}

impl RunOutcome {
    pub fn signalled(&self) -> bool {
        self.signal.is_some()
    }
}

enum Waited {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run one script to completion.
///
/// `argv` is the argument vector after the program itself; `env` is the
/// complete environment (nothing is inherited). With no timeout the wait
/// is unbounded. Cancelling `cancel` force-kills the child's process
/// group; the call still runs to completion of the reap.
///
/// Spawn failure is the only error path; everything that happens after a
/// successful spawn is reported inside [`RunOutcome`].
pub async fn run_script(
    path: &Path,
    argv: &[String],
    env: &[(String, String)],
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> io::Result<RunOutcome> {
    let (output_read, output_write) = pipe().map_err(io::Error::from)?;
    let stderr_write = output_write.try_clone()?;

    let mut cmd = Command::new(path);
    cmd.args(argv)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(output_write))
        .stderr(Stdio::from(stderr_write))
        .process_group(0);

    let mut child = cmd.spawn()?;
    // The Stdio handles inside cmd hold the parent's copies of the write
    // end; they must close now or the drain task never sees EOF.
    drop(cmd);

    let drain = tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::from(output_read);
        let mut captured = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => captured.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        captured
    });

    let waited = {
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            status = child.wait() => Waited::Exited(status?),
            _ = deadline => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        }
    };

    let (status, timed_out, signal) = match waited {
        Waited::Exited(status) => {
            let (code, signal) = classify(status);
            (code, false, signal)
        }
        Waited::TimedOut => {
            tracing::debug!(path = %path.display(), ?timeout, "Script timed out, killing process group");
            kill_group(&mut child);
            let _ = child.wait().await;
            (STATUS_TIMEOUT, true, None)
        }
        Waited::Cancelled => {
            tracing::debug!(path = %path.display(), "Script cancelled, killing process group");
            kill_group(&mut child);
            let status = child.wait().await?;
            let signo = std::os::unix::process::ExitStatusExt::signal(&status)
                .unwrap_or(Signal::SIGKILL as i32);
            (128 + signo, false, Some(signo))
        }
    };

    let output = match tokio::time::timeout(OUTPUT_DRAIN_BOUND, drain).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Output drain task failed");
            String::new()
        }
        Err(_) => {
            tracing::debug!(path = %path.display(), "Output drain still open past bound, abandoning");
            String::new()
        }
    };

    Ok(RunOutcome {
        status,
        output,
        timed_out,
        signal,
    })
}

fn classify(status: std::process::ExitStatus) -> (i32, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        (code, None)
    } else if let Some(sig) = status.signal() {
        (128 + sig, Some(sig))
    } else {
        (-1, None)
    }
}

fn kill_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "killpg failed, killing child directly");
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn true_exits_zero() {
        let outcome = run_script(
            Path::new("/bin/true"),
            &[],
            &[],
            Some(Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, 0);
        assert!(!outcome.timed_out);
        assert!(!outcome.signalled());
    }

    #[tokio::test]
    async fn captures_combined_output_and_exit_code() {
        let (path, argv) = sh("echo out; echo err 1>&2; exit 3");
        let outcome = run_script(&path, &argv, &[], None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, 3);
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
    }

    #[tokio::test]
    async fn environment_is_exactly_what_was_passed() {
        let (path, argv) = sh("printf '%s' \"$GREETING\"");
        let env = vec![("GREETING".to_string(), "hello".to_string())];
        let outcome = run_script(&path, &argv, &env, None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.output, "hello");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = Instant::now();
        let (path, argv) = sh("/bin/sleep 30");
        let outcome = run_script(
            &path,
            &argv,
            &[],
            Some(Duration::from_millis(300)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.signalled());
        assert_eq!(outcome.status, STATUS_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let cancel = CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel();
        });

        let started = Instant::now();
        let (path, argv) = sh("/bin/sleep 30");
        let outcome = run_script(&path, &argv, &[], None, cancel).await.unwrap();

        assert!(!outcome.timed_out);
        assert!(outcome.signalled());
        assert_eq!(outcome.signal, Some(Signal::SIGKILL as i32));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_script_is_a_spawn_error() {
        let err = run_script(
            Path::new("/nonexistent/script.sh"),
            &[],
            &[],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
