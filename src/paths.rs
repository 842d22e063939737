//! Directory resolution for the helper.
//!
//! Running as root (the normal deployment) uses fixed system locations.
//! Running as an ordinary user, for development and tests, follows XDG via
//! `etcetera`. Either way each directory can be overridden:
//! 1. SWEEP_HELPER_{CONFIG,STATE,RUNTIME}_DIR (absolute paths only)
//! 2. System location (uid 0) or XDG location (any other uid)
//!
//! All paths are absolute. Relative and empty overrides are ignored.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "sweep-helper";

/// Resolved directories. Created once at startup, threaded through Config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// config.toml lives here. The helper never writes to it.
    pub config_dir: PathBuf,

    /// Audit log, daemon logs.
    pub state_dir: PathBuf,

    /// Socket, PID file, instance lock.
    pub runtime_dir: PathBuf,

    /// True when resolved for uid 0.
    pub system: bool,
}

type EnvFn<'a> = dyn Fn(&str) -> std::result::Result<String, std::env::VarError> + 'a;

impl Paths {
    /// Resolve using real environment variables and the real uid.
    pub fn resolve() -> Result<Self> {
        let uid = unsafe { libc::getuid() };
        Self::resolve_for_uid(&|key: &str| std::env::var(key), uid)
    }

    /// Resolve with a custom env lookup and uid (for testing).
    pub fn resolve_for_uid(env_fn: &EnvFn<'_>, uid: u32) -> Result<Self> {
        let system = uid == 0;

        let (config_default, state_default, runtime_default) = if system {
            (
                PathBuf::from("/etc").join(APP_NAME),
                system_state_root().join(APP_NAME),
                PathBuf::from("/var/run").join(APP_NAME),
            )
        } else {
            use etcetera::BaseStrategy;

            let strategy = etcetera::choose_base_strategy()
                .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;
            let state_base = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            (
                strategy.config_dir().join(APP_NAME),
                state_base.join(APP_NAME),
                user_runtime_dir(env_fn, uid),
            )
        };

        Ok(Self {
            config_dir: env_or(env_fn, "SWEEP_HELPER_CONFIG_DIR", config_default),
            state_dir: env_or(env_fn, "SWEEP_HELPER_STATE_DIR", state_default),
            runtime_dir: env_or(env_fn, "SWEEP_HELPER_RUNTIME_DIR", runtime_default),
            system,
        })
    }

    /// Paths rooted under a single directory.
    pub fn under(base: &Path) -> Self {
        Self {
            config_dir: base.join("config"),
            state_dir: base.join("state"),
            runtime_dir: base.join("run"),
            system: false,
        }
    }

    // ── Convenience accessors for specific files ──

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn audit_log(&self) -> PathBuf {
        crate::security::audit_file_path(&self.state_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn socket(&self) -> PathBuf {
        self.runtime_dir.join("helper.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("helper.pid")
    }

    pub fn instance_lock(&self) -> PathBuf {
        self.runtime_dir.join("helper.lock")
    }

    /// Create state and runtime directories.
    ///
    /// The runtime directory is world-traversable when running as root so
    /// unprivileged clients can reach the socket; access is then governed
    /// by the socket's own mode and the peer uid check.
    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir_with_mode(&self.state_dir, 0o700)?;
        create_dir_with_mode(&self.runtime_dir, if self.system { 0o755 } else { 0o700 })?;
        create_dir_with_mode(&self.logs_dir(), 0o700)?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Emergency fallback when no home directory can be determined
            let uid = unsafe { libc::getuid() };
            Self::under(&PathBuf::from("/tmp").join(format!("{APP_NAME}-{uid}")))
        })
    }
}

fn system_state_root() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/var/db")
    } else {
        PathBuf::from("/var/lib")
    }
}

fn env_or(env_fn: &EnvFn<'_>, var: &str, default: PathBuf) -> PathBuf {
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or(default)
}

/// XDG_RUNTIME_DIR, else `$TMPDIR/sweep-helper-$UID`.
fn user_runtime_dir(env_fn: &EnvFn<'_>, uid: u32) -> PathBuf {
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return path.join(APP_NAME);
        }
    }

    let tmpdir = env_fn("TMPDIR")
        .ok()
        .filter(|t| t.starts_with('/'))
        .unwrap_or_else(|| "/tmp".to_string());
    PathBuf::from(tmpdir).join(format!("{APP_NAME}-{uid}"))
}

fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn root_uses_system_locations() {
        let paths = Paths::resolve_for_uid(&make_env(HashMap::new()), 0).unwrap();
        assert!(paths.system);
        assert_eq!(paths.config_dir, PathBuf::from("/etc/sweep-helper"));
        assert_eq!(paths.runtime_dir, PathBuf::from("/var/run/sweep-helper"));
        assert!(paths.state_dir.starts_with("/var"));
        assert!(paths.state_dir.ends_with("sweep-helper"));
    }

    #[test]
    fn user_paths_are_xdg_style() {
        let paths = Paths::resolve_for_uid(&make_env(HashMap::new()), 501).unwrap();
        assert!(!paths.system);
        assert!(paths.config_dir.ends_with("sweep-helper"), "{:?}", paths.config_dir);
        assert!(paths.state_dir.ends_with("sweep-helper"), "{:?}", paths.state_dir);
        assert_eq!(paths.runtime_dir, PathBuf::from("/tmp/sweep-helper-501"));
    }

    #[test]
    fn runtime_prefers_xdg_runtime_dir() {
        let env = HashMap::from([("XDG_RUNTIME_DIR", "/run/user/501"), ("TMPDIR", "/var/tmp")]);
        let paths = Paths::resolve_for_uid(&make_env(env), 501).unwrap();
        assert_eq!(paths.runtime_dir, PathBuf::from("/run/user/501/sweep-helper"));

        let env = HashMap::from([("TMPDIR", "/var/tmp")]);
        let paths = Paths::resolve_for_uid(&make_env(env), 501).unwrap();
        assert_eq!(paths.runtime_dir, PathBuf::from("/var/tmp/sweep-helper-501"));
    }

    #[test]
    fn env_overrides_win_for_any_uid() {
        let env = HashMap::from([
            ("SWEEP_HELPER_CONFIG_DIR", "/custom/config"),
            ("SWEEP_HELPER_STATE_DIR", "/custom/state"),
            ("SWEEP_HELPER_RUNTIME_DIR", "/custom/run"),
        ]);
        for uid in [0, 501] {
            let paths = Paths::resolve_for_uid(&make_env(env.clone()), uid).unwrap();
            assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
            assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
            assert_eq!(paths.runtime_dir, PathBuf::from("/custom/run"));
        }
    }

    #[test]
    fn relative_and_empty_overrides_are_ignored() {
        let env = HashMap::from([
            ("SWEEP_HELPER_CONFIG_DIR", "relative/path"),
            ("SWEEP_HELPER_STATE_DIR", ""),
        ]);
        let paths = Paths::resolve_for_uid(&make_env(env), 0).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/etc/sweep-helper"));
        assert!(paths.state_dir.is_absolute());
    }

    #[test]
    fn convenience_accessors() {
        let paths = Paths::under(Path::new("/srv/helper"));
        assert_eq!(paths.config_file(), PathBuf::from("/srv/helper/config/config.toml"));
        assert!(paths.audit_log().ends_with("helper.audit.jsonl"));
        assert_eq!(paths.socket(), PathBuf::from("/srv/helper/run/helper.sock"));
        assert!(paths.pid_file().ends_with("helper.pid"));
        assert!(paths.instance_lock().ends_with("helper.lock"));
        assert!(paths.logs_dir().ends_with("state/logs"));
    }

    #[test]
    fn ensure_dirs_creates_private_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::under(tmp.path());
        paths.ensure_dirs().unwrap();

        for dir in [&paths.state_dir, &paths.runtime_dir] {
            let mode = std::fs::metadata(dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700, "{}", dir.display());
        }
        assert!(!paths.config_dir.exists());
    }
}
