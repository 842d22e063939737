use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::capture::{RunState, Stream};
use super::child;
use super::policy::ExecutionLimits;
use super::result::ExecutionResult;
use crate::security::{CommandGate, ErrorCode, HelperError, VettedCommand};

const READ_CHUNK: usize = 16 * 1024;

/// Counters for observing the executor from tests and `check`.
#[derive(Debug, Default)]
pub struct ExecutorProbe {
    pub(crate) spawns: AtomicUsize,
    pub(crate) finalizations: AtomicUsize,
    pub(crate) last_pid: AtomicU32,
}

impl ExecutorProbe {
    /// Spawn attempts, counted before `spawn` is called.
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn finalizations(&self) -> usize {
        self.finalizations.load(Ordering::SeqCst)
    }

    pub fn last_pid(&self) -> Option<u32> {
        match self.last_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Runs gate-approved executables with captured, capped output and a
/// hard time bound.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    gate: CommandGate,
    limits: ExecutionLimits,
    probe: Arc<ExecutorProbe>,
}

impl ProcessExecutor {
    pub fn new(gate: CommandGate, limits: ExecutionLimits) -> Self {
        Self {
            gate,
            limits,
            probe: Arc::new(ExecutorProbe::default()),
        }
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn probe(&self) -> Arc<ExecutorProbe> {
        self.probe.clone()
    }

    /// Gate `executable`, run it with `arguments`, and return exactly one
    /// result. Never waits longer than `limits.outer_bound()` plus the
    /// reap allowance on timeout.
    pub async fn run(&self, executable: &str, arguments: &[String]) -> ExecutionResult {
        let gate = self.gate.clone();
        let requested = executable.to_string();
        let vetted = match tokio::task::spawn_blocking(move || gate.check(&requested)).await {
            Ok(Ok(vetted)) => vetted,
            Ok(Err(e)) => {
                warn!(executable, "refusing to run: {e}");
                return ExecutionResult::start_failed(e.code());
            }
            Err(e) => {
                warn!(executable, "gate task failed: {e}");
                return ExecutionResult::start_failed(ErrorCode::Unknown);
            }
        };

        self.run_vetted(&vetted, arguments).await
    }

    async fn run_vetted(&self, vetted: &VettedCommand, arguments: &[String]) -> ExecutionResult {
        let limits = &self.limits;

        let mut cmd = Command::new(&vetted.canonical);
        cmd.arg0(&vetted.requested)
            .args(arguments)
            .env_clear()
            .envs(limits.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        child::install_limits(&mut cmd, limits.max_open_files);

        self.probe.spawns.fetch_add(1, Ordering::SeqCst);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = HelperError::ProcessStartFailed {
                    executable: vetted.requested.display().to_string(),
                    source,
                };
                warn!("{err}");
                return ExecutionResult::start_failed(err.code());
            }
        };

        let pid = child.id();
        self.probe
            .last_pid
            .store(pid.unwrap_or_default(), Ordering::SeqCst);
        debug!(
            pid,
            executable = %vetted.canonical.display(),
            args = ?arguments,
            "spawned child"
        );

        let state = Arc::new(RunState::new(limits.max_output_bytes, self.probe.clone()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut tasks = RunTasks {
            helpers: vec![
                tokio::spawn(pump(stdout, Stream::Stdout, state.clone())),
                tokio::spawn(pump(stderr, Stream::Stderr, state.clone())),
                tokio::spawn(timer(limits.timeout, state.clone())),
            ],
            waiter: tokio::spawn(wait_child(
                child,
                pid,
                state.clone(),
                limits.kill_grace,
                limits.drain_grace,
            )),
        };

        let result = match tokio::time::timeout(limits.outer_bound(), state.wait_finalized()).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(pid, "run exceeded its outer bound, forcing timeout");
                state.force_timeout()
            }
        };

        // The waiter may still be terminating or sweeping the process group.
        let reap_bound = limits.kill_grace + limits.finalize_slack;
        if !tasks.reap(reap_bound).await {
            warn!(pid, "child not reaped within {}ms", reap_bound.as_millis());
        }

        debug!(pid, outcome = %result.summary(), "run finished");
        result
    }
}

/// Aborts every task of a run when dropped, including on cancellation of
/// the `run` future itself. Aborting the waiter drops the `Child`, which
/// kills it via `kill_on_drop`.
struct RunTasks {
    waiter: JoinHandle<()>,
    helpers: Vec<JoinHandle<()>>,
}

impl RunTasks {
    async fn reap(&mut self, bound: Duration) -> bool {
        tokio::time::timeout(bound, &mut self.waiter).await.is_ok()
    }
}

impl Drop for RunTasks {
    fn drop(&mut self) {
        self.waiter.abort();
        for task in &self.helpers {
            task.abort();
        }
    }
}

async fn pump<R>(reader: Option<R>, stream: Stream, state: Arc<RunState>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        state.close(stream);
        return;
    };

    let cancel = state.cancel_token();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => state.append(stream, &buf[..n]),
                Err(e) => {
                    debug!(?stream, "pipe read failed: {e}");
                    break;
                }
            },
        }
    }
    state.close(stream);
}

async fn timer(timeout: Duration, state: Arc<RunState>) {
    let cancel = state.cancel_token();
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            if state.finalize_timeout() {
                debug!("timeout after {}ms", timeout.as_millis());
            }
        }
    }
}

/// Owns the child. Records its exit, or terminates it once the run is
/// finalized without an exit (timeout). If the run ended while a pipe was
/// still held open, whatever is left of the process group is killed.
async fn wait_child(
    mut child: Child,
    pid: Option<u32>,
    state: Arc<RunState>,
    kill_grace: Duration,
    drain_grace: Duration,
) {
    let cancel = state.cancel_token();

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => state.record_exit(status),
            Err(e) => {
                // Exit cannot be observed; the caller's outer bound finalizes.
                warn!(pid, "waiting for child failed: {e}");
                terminate(&mut child, pid, kill_grace).await;
                return;
            }
        },
        _ = cancel.cancelled() => {
            terminate(&mut child, pid, kill_grace).await;
            return;
        }
    }

    // Exited. A descendant may still hold a pipe open.
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(drain_grace) => {
            if state.finalize_after_drain() {
                debug!(pid, "pipes still open {}ms after exit", drain_grace.as_millis());
            }
        }
    }

    if state.pipes_left_open()
        && let Some(pid) = pid
    {
        sweep_group(pid);
    }
}

/// SIGTERM the group, SIGKILL it after `grace`, then reap.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        signal_group(pid, Signal::SIGTERM);
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        // Leader went down on SIGTERM and is reaped; members ignoring it
        // are still running.
        if let Some(pid) = pid {
            sweep_group(pid);
        }
        return;
    }

    // Leader is unreaped here, so the group id still belongs to this run.
    if let Some(pid) = pid {
        signal_group(pid, Signal::SIGKILL);
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// SIGKILL what remains of a group whose leader has already been reaped.
///
/// Any live member keeps the group id from being reissued. The id can only
/// reach an unrelated group if every member exits and the pid counter wraps
/// around to hand it to a new group leader between the reap and this call.
fn sweep_group(pgid: u32) {
    signal_group(pgid, Signal::SIGKILL);
}

fn signal_group(pgid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => debug!(pgid, ?signal, "killpg failed: {e}"),
    }
}
