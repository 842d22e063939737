//! # Privilege Boundary
//!
//! Everything that decides whether the helper may touch a file or start a
//! process is re-exported here. Review this module and the files it lists
//! to audit what an unprivileged caller can make the helper do.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  boundary.rs (you are here)                      │
//! │                  Public API facade & threat model                │
//! ├────────────────┬───────────────┬────────────────┬────────────────┤
//! │  allowlist.rs  │  deleter.rs   │ command_gate.rs│  audit.rs      │
//! │  Lexical root  │  fd-anchored  │ Canonical exe  │  Hash-chained  │
//! │  checks per    │  fstatat +    │ allowlist +    │  record of     │
//! │  scope         │  unlinkat     │ signature.rs   │  every request │
//! ├────────────────┴───────────────┴────────────────┴────────────────┤
//! │  errors.rs - ErrorCode (wire) and HelperError (local context)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Fail closed**: a path that does not normalize, a parent that does
//!    not canonicalize, or a binary that does not resolve is rejected.
//!    Nothing falls back to a more permissive check.
//!
//! 2. **Validate, then anchor**: string checks only decide whether to look
//!    at the filesystem. The destructive syscall is made relative to a
//!    directory descriptor opened without following symlinks, so a swap
//!    after validation cannot redirect it.
//!
//! 3. **Roots are never targets**: a configured root may contain deletions
//!    but can never be deleted itself.
//!
//! 4. **No search path**: executables are named by absolute path,
//!    canonicalized, compared against a fixed set and, in production,
//!    signature-checked before every spawn.
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | `..` traversal out of a root | Lexical normalization before the root check |
//! | Parent replaced by symlink before the check | Canonical parent re-checked |
//! | Parent replaced by symlink after the check | `O_NOFOLLOW` walk to the anchor |
//! | Target is a symlink | `AT_SYMLINK_NOFOLLOW`; only the link is removed |
//! | Immutable system file | Flag check before unlink |
//! | Arbitrary binary | Canonical allowlist + signature gate |
//! | Binary replaced in place | Code signature or pinned SHA-256 |
//! | Hung or chatty child | Executor timeout and output caps |
//! | Unknown local client | Socket mode and peer uid allowlist |

// ── Errors ──────────────────────────────────────────────────────────

pub use super::errors::{ErrorCode, HelperError};

// ── Path Allowlist & Deletion ───────────────────────────────────────

pub use super::allowlist::{AllowlistScope, NormalizedPath, PathAllowlist, normalize};
pub use super::deleter::{Deletion, EntryKind, SecureDeleter};

// ── Command Gate ────────────────────────────────────────────────────

pub use super::command_gate::{CommandAllowlist, CommandGate, VettedCommand};
pub use super::signature::{
    AcceptAllVerifier, CodesignVerifier, DigestPinVerifier, SignatureVerifier, file_sha256,
    platform_verifier,
};

// ── Audit Log ───────────────────────────────────────────────────────

pub use super::audit::{
    AuditAction, AuditEntry, AuditLog, GENESIS_HASH, append_audit_entry, audit_file_path,
    read_audit_log, verify_audit_chain,
};
