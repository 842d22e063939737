//! Bounded execution of allowlisted programs.
//!
//! Every run passes the command gate, then spawns the canonical binary in
//! its own process group with a minimal environment, null stdin and
//! pre-exec rlimits. Two pipe readers, a timer and an exit waiter race to
//! finalize; exactly one wins and produces the [`ExecutionResult`].
//!
//! Time bound: the caller never waits longer than
//! `timeout + kill_grace + finalize_slack`, plus one reap allowance when
//! the run timed out.

pub mod capture;
pub mod child;
pub mod executor;
pub mod policy;
pub mod result;

pub use executor::{ExecutorProbe, ProcessExecutor};
pub use policy::ExecutionLimits;
pub use result::{ExecutionResult, TerminationReason};
