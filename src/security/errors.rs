//! Error taxonomy shared by every operation behind the privilege boundary.
//!
//! [`ErrorCode`] is the wire-stable symbolic code the unprivileged caller
//! sees. [`HelperError`] carries the same information plus local context
//! for logging; it never crosses the socket as anything but its code and
//! display message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Symbolic error codes returned across the RPC boundary.
///
/// The serialized names are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    PathNotAllowed,
    SymlinkEscape,
    FileNotFound,
    PermissionDenied,
    ImmutableFile,
    ReadOnlyFilesystem,
    DirectoryNotEmpty,
    CommandNotAllowlisted,
    SignatureInvalid,
    ProcessStartFailed,
    Timeout,
    Unknown,
}

impl ErrorCode {
    /// Map an OS error number to the taxonomy.
    ///
    /// Anything not listed maps to [`ErrorCode::Unknown`].
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Self::FileNotFound,
            libc::EACCES | libc::EPERM => Self::PermissionDenied,
            libc::EROFS => Self::ReadOnlyFilesystem,
            libc::ELOOP => Self::SymlinkEscape,
            libc::ENOTEMPTY => Self::DirectoryNotEmpty,
            _ => Self::Unknown,
        }
    }

    /// Map an I/O error, falling back to `Unknown` when it has no errno.
    pub fn from_io(err: &io::Error) -> Self {
        err.raw_os_error()
            .map(Self::from_errno)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathNotAllowed => "PathNotAllowed",
            Self::SymlinkEscape => "SymlinkEscape",
            Self::FileNotFound => "FileNotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::ImmutableFile => "ImmutableFile",
            Self::ReadOnlyFilesystem => "ReadOnlyFilesystem",
            Self::DirectoryNotEmpty => "DirectoryNotEmpty",
            Self::CommandNotAllowlisted => "CommandNotAllowlisted",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::ProcessStartFailed => "ProcessStartFailed",
            Self::Timeout => "Timeout",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the allowlists, the deleter and the executor.
#[derive(Debug, Error)]
pub enum HelperError {
    #[error("path is not inside an allowed root: {path}")]
    PathNotAllowed { path: String },

    #[error("{} resolves outside the allowed roots", path.display())]
    SymlinkEscape { path: PathBuf },

    #[error("entry is marked immutable: {}", path.display())]
    ImmutableFile { path: PathBuf },

    /// A syscall failed; `code` is the errno mapped through the fixed table.
    #[error("{context}: {source}")]
    Os {
        context: String,
        code: ErrorCode,
        #[source]
        source: io::Error,
    },

    #[error("command is not allowlisted: {executable}")]
    CommandNotAllowlisted { executable: String },

    #[error("signature check failed for {}: {reason}", path.display())]
    SignatureInvalid { path: PathBuf, reason: String },

    #[error("failed to start {executable}: {source}")]
    ProcessStartFailed {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl HelperError {
    /// Wrap a failed syscall, mapping its errno to a code.
    pub fn os(context: impl Into<String>, source: io::Error) -> Self {
        Self::Os {
            context: context.into(),
            code: ErrorCode::from_io(&source),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PathNotAllowed { .. } => ErrorCode::PathNotAllowed,
            Self::SymlinkEscape { .. } => ErrorCode::SymlinkEscape,
            Self::ImmutableFile { .. } => ErrorCode::ImmutableFile,
            Self::Os { code, .. } => *code,
            Self::CommandNotAllowlisted { .. } => ErrorCode::CommandNotAllowlisted,
            Self::SignatureInvalid { .. } => ErrorCode::SignatureInvalid,
            Self::ProcessStartFailed { .. } => ErrorCode::ProcessStartFailed,
            Self::Timeout(_) => ErrorCode::Timeout,
        }
    }
}
