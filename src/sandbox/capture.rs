//! Shared state for one run: capped output buffers and the
//! exactly-once finalization that the timer, the exit waiter and the pipe
//! readers race for.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::executor::ExecutorProbe;
use super::result::{ExecutionResult, TerminationReason};
use crate::security::ErrorCode;

/// Accumulates at most `cap` bytes. Once bytes have been dropped the
/// truncation flag stays set.
#[derive(Debug)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let keep = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..keep]);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct RunInner {
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    stdout_open: bool,
    stderr_open: bool,
    exit: Option<ExitStatus>,
    finalized: bool,
    pipes_left_open: bool,
    result: Option<ExecutionResult>,
}

/// One mutex guards every field. It is held only for counter updates and
/// flag checks, never across an await.
#[derive(Debug)]
pub struct RunState {
    inner: Mutex<RunInner>,
    done: Notify,
    cancel: CancellationToken,
    probe: Arc<ExecutorProbe>,
}

impl RunState {
    pub fn new(cap: usize, probe: Arc<ExecutorProbe>) -> Self {
        Self {
            inner: Mutex::new(RunInner {
                stdout: CappedBuffer::new(cap),
                stderr: CappedBuffer::new(cap),
                stdout_open: true,
                stderr_open: true,
                exit: None,
                finalized: false,
                pipes_left_open: false,
                result: None,
            }),
            done: Notify::new(),
            cancel: CancellationToken::new(),
            probe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancelled once the run is finalized, for any reason.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    /// Whether a pipe was still held open when the run was finalized, i.e.
    /// something in the child's group may have outlived it.
    pub fn pipes_left_open(&self) -> bool {
        self.lock().pipes_left_open
    }

    /// Ignored after finalization so a timed-out run stops accumulating.
    pub fn append(&self, stream: Stream, chunk: &[u8]) {
        let mut inner = self.lock();
        if inner.finalized {
            return;
        }
        match stream {
            Stream::Stdout => inner.stdout.push(chunk),
            Stream::Stderr => inner.stderr.push(chunk),
        }
    }

    pub fn close(&self, stream: Stream) {
        let mut inner = self.lock();
        match stream {
            Stream::Stdout => inner.stdout_open = false,
            Stream::Stderr => inner.stderr_open = false,
        }
        self.try_finalize_natural(&mut inner);
    }

    pub fn record_exit(&self, status: ExitStatus) {
        let mut inner = self.lock();
        inner.exit = Some(status);
        self.try_finalize_natural(&mut inner);
    }

    /// Timer expiry. An exit recorded before the timer fired still wins;
    /// only the output is marked incomplete. Returns true if this call
    /// finalized the run.
    pub fn finalize_timeout(&self) -> bool {
        let mut inner = self.lock();
        let reason = expiry_reason(&inner);
        self.finalize(&mut inner, reason, true)
    }

    /// Exit was observed but a pipe is still open after the drain grace.
    /// Returns true if this call finalized the run.
    pub fn finalize_after_drain(&self) -> bool {
        let mut inner = self.lock();
        let Some(status) = inner.exit else {
            return false;
        };
        self.finalize(&mut inner, reason_for(status), true)
    }

    /// Outer bound expired: finalize like a timer expiry unless already
    /// done, and hand back the result.
    pub fn force_timeout(&self) -> ExecutionResult {
        let mut inner = self.lock();
        let reason = expiry_reason(&inner);
        self.finalize(&mut inner, reason, true);
        inner
            .result
            .take()
            .unwrap_or_else(|| ExecutionResult::start_failed(ErrorCode::Timeout))
    }

    /// Wait until some path finalizes, then take the result.
    pub async fn wait_finalized(&self) -> ExecutionResult {
        loop {
            if let Some(result) = self.lock().result.take() {
                return result;
            }
            self.done.notified().await;
        }
    }

    fn try_finalize_natural(&self, inner: &mut RunInner) {
        if inner.stdout_open || inner.stderr_open {
            return;
        }
        if let Some(status) = inner.exit {
            self.finalize(inner, reason_for(status), false);
        }
    }

    /// The only place a result is built. Checked and set under the lock.
    fn finalize(
        &self,
        inner: &mut RunInner,
        reason: TerminationReason,
        incomplete: bool,
    ) -> bool {
        if inner.finalized {
            return false;
        }
        inner.finalized = true;
        inner.pipes_left_open = inner.stdout_open || inner.stderr_open;

        let (exit_code, termination_status) = match (reason, inner.exit) {
            (TerminationReason::Exit, Some(status)) => (status.code(), status.code()),
            (TerminationReason::Signal(sig), _) => (Some(128 + sig), Some(sig)),
            _ => (None, None),
        };
        let error = match reason {
            TerminationReason::Timeout => Some(ErrorCode::Timeout),
            _ => None,
        };

        inner.result = Some(ExecutionResult {
            exit_code,
            termination_status,
            stdout_truncated: inner.stdout.is_truncated(),
            stderr_truncated: inner.stderr.is_truncated(),
            stdout: inner.stdout.take(),
            stderr: inner.stderr.take(),
            output_may_be_incomplete: incomplete,
            reason,
            error,
        });

        self.probe.finalizations.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        self.done.notify_one();
        true
    }
}

fn expiry_reason(inner: &RunInner) -> TerminationReason {
    inner
        .exit
        .map(reason_for)
        .unwrap_or(TerminationReason::Timeout)
}

fn reason_for(status: ExitStatus) -> TerminationReason {
    match status.signal() {
        Some(sig) => TerminationReason::Signal(sig),
        None => TerminationReason::Exit,
    }
}
