//! Symlink-escape-resistant deletion.
//!
//! The target's parent is canonicalized, checked against the allowlist, then
//! opened component by component from `/` with `O_NOFOLLOW`. Every syscall
//! after that is relative to the opened descriptor, so swapping a path
//! component for a symlink after validation cannot redirect the unlink.

use std::ffi::{CStr, CString};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::allowlist::{AllowlistScope, NormalizedPath, PathAllowlist, normalize};
use super::errors::HelperError;

/// What kind of entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    fn from_mode(mode: libc::mode_t) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Self::File,
            libc::S_IFDIR => Self::Directory,
            libc::S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// A completed deletion.
#[derive(Debug, Clone)]
pub struct Deletion {
    pub path: NormalizedPath,
    pub kind: EntryKind,
}

/// Deletes single entries strictly inside the allowlisted roots.
#[derive(Debug, Clone)]
pub struct SecureDeleter {
    allowlist: Arc<PathAllowlist>,
}

impl SecureDeleter {
    pub fn new(allowlist: Arc<PathAllowlist>) -> Self {
        Self { allowlist }
    }

    pub fn allowlist(&self) -> &PathAllowlist {
        &self.allowlist
    }

    /// Delete one file, symlink or empty directory.
    ///
    /// Blocking: runs a short chain of syscalls. Async callers should use
    /// `spawn_blocking`.
    pub fn delete(&self, raw: &str, scope: AllowlistScope) -> Result<Deletion, HelperError> {
        let not_allowed = || HelperError::PathNotAllowed {
            path: raw.to_string(),
        };

        let target = normalize(raw).ok_or_else(not_allowed)?;
        if !self.allowlist.is_target_allowed(&target, scope) {
            return Err(not_allowed());
        }

        let (parent, name) = target.split_parent();
        let canonical_parent = std::fs::canonicalize(parent)
            .map_err(|e| HelperError::os(format!("resolving {parent}"), e))?;

        if !self.allowlist.is_parent_allowed(&canonical_parent, scope) {
            return Err(HelperError::SymlinkEscape {
                path: canonical_parent,
            });
        }

        let anchor = Anchor::open(&canonical_parent)?;
        let name = CString::new(name).map_err(|_| not_allowed())?;

        let stat = anchor.stat_entry(&name)?;
        let kind = EntryKind::from_mode(stat.st_mode);

        if anchor.is_immutable(&name, &stat) {
            return Err(HelperError::ImmutableFile {
                path: target.as_path().to_path_buf(),
            });
        }

        anchor.unlink(&name, kind == EntryKind::Directory)?;

        debug!(path = %target, ?kind, %scope, "deleted entry");
        Ok(Deletion { path: target, kind })
    }
}

/// An open directory descriptor that every later syscall is relative to.
/// Closed on drop.
struct Anchor {
    fd: OwnedFd,
    path: PathBuf,
}

impl Anchor {
    /// Walk `canonical` from `/`, refusing to follow a symlink at any level.
    fn open(canonical: &Path) -> Result<Self, HelperError> {
        let mut fd = open_dir(None, c"/").map_err(|e| HelperError::os("opening /", e))?;

        for component in canonical.components() {
            let name = match component {
                Component::RootDir => continue,
                Component::Normal(name) => name,
                // canonicalize never yields these
                _ => {
                    return Err(HelperError::SymlinkEscape {
                        path: canonical.to_path_buf(),
                    });
                }
            };
            let c_name = CString::new(name.as_bytes()).map_err(|_| HelperError::SymlinkEscape {
                path: canonical.to_path_buf(),
            })?;

            fd = open_dir(Some(&fd), &c_name).map_err(|e| match e.raw_os_error() {
                Some(libc::ELOOP) | Some(libc::ENOTDIR) => HelperError::SymlinkEscape {
                    path: canonical.to_path_buf(),
                },
                _ => HelperError::os(format!("opening {}", canonical.display()), e),
            })?;
        }

        Ok(Self {
            fd,
            path: canonical.to_path_buf(),
        })
    }

    fn stat_entry(&self, name: &CStr) -> Result<libc::stat, HelperError> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        // SAFETY: valid dirfd and NUL-terminated name; stat is written on success.
        let rc = unsafe {
            libc::fstatat(
                self.fd.as_raw_fd(),
                name.as_ptr(),
                stat.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(self.entry_error("inspecting", name));
        }
        // SAFETY: fstatat returned 0.
        Ok(unsafe { stat.assume_init() })
    }

    #[cfg(target_os = "macos")]
    fn is_immutable(&self, _name: &CStr, stat: &libc::stat) -> bool {
        const UF_IMMUTABLE: u32 = 0x0000_0002;
        const SF_IMMUTABLE: u32 = 0x0002_0000;
        stat.st_flags & (UF_IMMUTABLE | SF_IMMUTABLE) != 0
    }

    #[cfg(target_os = "linux")]
    fn is_immutable(&self, name: &CStr, stat: &libc::stat) -> bool {
        const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

        match stat.st_mode & libc::S_IFMT {
            libc::S_IFREG | libc::S_IFDIR => {}
            _ => return false,
        }

        // SAFETY: valid dirfd and NUL-terminated name.
        let raw = unsafe {
            libc::openat(
                self.fd.as_raw_fd(),
                name.as_ptr(),
                libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            // Unreadable entries fall through to unlinkat, which reports the real error.
            return false;
        }
        // SAFETY: openat returned a fresh descriptor we now own.
        let entry = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut flags: libc::c_long = 0;
        // SAFETY: FS_IOC_GETFLAGS writes at most a long into `flags`.
        match unsafe { fs_ioc_getflags(entry.as_raw_fd(), &mut flags) } {
            Ok(_) => flags & FS_IMMUTABLE_FL != 0,
            // ENOTTY/EOPNOTSUPP: filesystem has no inode flags.
            Err(_) => false,
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    fn is_immutable(&self, _name: &CStr, _stat: &libc::stat) -> bool {
        false
    }

    fn unlink(&self, name: &CStr, directory: bool) -> Result<(), HelperError> {
        let flags = if directory { libc::AT_REMOVEDIR } else { 0 };
        // SAFETY: valid dirfd and NUL-terminated name.
        let rc = unsafe { libc::unlinkat(self.fd.as_raw_fd(), name.as_ptr(), flags) };
        if rc != 0 {
            return Err(self.entry_error("removing", name));
        }
        Ok(())
    }

    fn entry_error(&self, verb: &str, name: &CStr) -> HelperError {
        let err = io::Error::last_os_error();
        HelperError::os(
            format!(
                "{verb} {}",
                self.path.join(std::ffi::OsStr::from_bytes(name.to_bytes())).display()
            ),
            err,
        )
    }
}

#[cfg(target_os = "linux")]
nix::ioctl_read!(fs_ioc_getflags, b'f', 1, libc::c_long);

fn open_dir(parent: Option<&OwnedFd>, name: &CStr) -> io::Result<OwnedFd> {
    let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC;
    // SAFETY: NUL-terminated name; dirfd is either AT_FDCWD or a live descriptor.
    let raw = unsafe {
        match parent {
            Some(dir) => libc::openat(dir.as_raw_fd(), name.as_ptr(), flags),
            None => libc::open(name.as_ptr(), flags),
        }
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fresh descriptor from open/openat.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
