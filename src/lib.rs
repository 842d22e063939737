//! sweep-helper - privileged maintenance helper for a disk-cleanup app
//!
//! This crate provides:
//! - Allowlisted, symlink-safe single-entry deletion
//! - Allowlisted, signature-checked command execution with hard time and
//!   output bounds
//! - A Unix-socket RPC surface exposing a fixed set of operations
//! - A hash-chained audit trail of every privileged action

#[cfg(not(unix))]
compile_error!("sweep-helper only supports Unix platforms");

pub mod concurrency;
pub mod config;
pub mod paths;
pub mod sandbox;
pub mod security;
pub mod server;

pub use config::Config;
