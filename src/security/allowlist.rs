//! Lexical path allowlist.
//!
//! Every check here is pure string work: nothing touches the filesystem.
//! A path that passes is still untrusted; the deleter re-validates the
//! canonicalized parent before acting on it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::errors::HelperError;

/// Which root set a request is checked against. Always chosen by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowlistScope {
    /// Log and cache directories only.
    #[default]
    Cleanup,
    /// Application bundles and per-app support directories.
    Uninstall,
}

impl fmt::Display for AllowlistScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleanup => f.write_str("cleanup"),
            Self::Uninstall => f.write_str("uninstall"),
        }
    }
}

/// An absolute path with `.`/`..` resolved lexically and no trailing slash.
///
/// Never `/` itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Lexical split into `(parent, name)`. The parent of `/a` is `/`.
    pub fn split_parent(&self) -> (&str, &str) {
        match self.0.rfind('/') {
            Some(0) => ("/", &self.0[1..]),
            Some(idx) => (&self.0[..idx], &self.0[idx + 1..]),
            // Unreachable for a normalized path, which always starts with '/'.
            None => ("/", self.0.as_str()),
        }
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize an absolute path without consulting the filesystem.
///
/// Returns `None` for the empty string, relative paths, paths containing a
/// NUL byte, and anything that collapses to `/`. `..` at the top stays at
/// `/`, as the kernel does.
pub fn normalize(path: &str) -> Option<NormalizedPath> {
    if path.is_empty() || !path.starts_with('/') || path.contains('\0') {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return None;
    }

    let mut normalized = String::with_capacity(path.len());
    for part in parts {
        normalized.push('/');
        normalized.push_str(part);
    }
    Some(NormalizedPath(normalized))
}

/// Root directories per scope. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct PathAllowlist {
    cleanup: Vec<NormalizedPath>,
    uninstall: Vec<NormalizedPath>,
}

impl PathAllowlist {
    pub fn new(cleanup: Vec<NormalizedPath>, uninstall: Vec<NormalizedPath>) -> Self {
        Self { cleanup, uninstall }
    }

    pub fn roots(&self, scope: AllowlistScope) -> &[NormalizedPath] {
        match scope {
            AllowlistScope::Cleanup => &self.cleanup,
            AllowlistScope::Uninstall => &self.uninstall,
        }
    }

    /// True iff `path` is a strict descendant of some root in `scope`.
    /// A root itself is never a valid target.
    pub fn is_target_allowed(&self, path: &NormalizedPath, scope: AllowlistScope) -> bool {
        let candidate = path.as_str().as_bytes();
        self.roots(scope)
            .iter()
            .any(|root| is_strict_descendant(candidate, root.as_str().as_bytes()))
    }

    /// True iff `path` equals a root in `scope` or is a strict descendant.
    ///
    /// Compared byte-wise so canonicalized paths that are not UTF-8 are
    /// still judged correctly (they can never match a UTF-8 root prefix
    /// by accident).
    pub fn is_parent_allowed(&self, path: &Path, scope: AllowlistScope) -> bool {
        let candidate = path.as_os_str().as_bytes();
        self.roots(scope).iter().any(|root| {
            let root = root.as_str().as_bytes();
            candidate == root || is_strict_descendant(candidate, root)
        })
    }

    /// Normalize and check a raw target in one step.
    pub fn check_target(
        &self,
        raw: &str,
        scope: AllowlistScope,
    ) -> Result<NormalizedPath, HelperError> {
        match normalize(raw) {
            Some(path) if self.is_target_allowed(&path, scope) => Ok(path),
            _ => Err(HelperError::PathNotAllowed {
                path: raw.to_string(),
            }),
        }
    }
}

fn is_strict_descendant(candidate: &[u8], root: &[u8]) -> bool {
    candidate.len() > root.len() + 1
        && candidate.starts_with(root)
        && candidate[root.len()] == b'/'
}
