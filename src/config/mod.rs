use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::paths::Paths;
use crate::security::{
    AcceptAllVerifier, CommandAllowlist, CommandGate, NormalizedPath, PathAllowlist,
    SignatureVerifier, normalize, platform_verifier,
};

/// Static helper configuration. Read once at startup; never written back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved directories (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub allowlist: AllowlistConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub operations: OperationsConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentMode {
    /// Production command set, signatures verified.
    #[default]
    Production,
    /// Test command set, signature check skipped.
    Test,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub mode: EnvironmentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistConfig {
    /// Roots for cleanup deletions (logs, caches). `~` expands to `user_home`.
    #[serde(default = "default_cleanup_roots")]
    pub cleanup_roots: Vec<String>,

    /// Roots for uninstall deletions (apps, per-app support data).
    #[serde(default = "default_uninstall_roots")]
    pub uninstall_roots: Vec<String>,

    /// Home directory of the console user the helper serves.
    /// Defaults to the helper's own home.
    #[serde(default)]
    pub user_home: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Executables runnable in production mode.
    #[serde(default = "default_production_commands")]
    pub production: Vec<String>,

    /// Executables runnable in test mode.
    #[serde(default = "default_test_commands")]
    pub test: Vec<String>,

    /// Path -> hex SHA-256. When non-empty, production binaries are checked
    /// against these pins instead of the platform signing authority.
    #[serde(default)]
    pub pinned_digests: HashMap<String, String>,

    /// Requirement passed to `codesign -R=` (macOS).
    #[serde(default = "default_codesign_requirement")]
    pub codesign_requirement: String,

    #[serde(default = "default_codesign_timeout")]
    pub codesign_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Wall-clock limit per command (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Per-stream capture cap (default: 10 MiB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// SIGTERM to SIGKILL delay
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// How long to keep reading after exit when a descendant holds a pipe
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Extra margin on the caller's outer wait
    #[serde(default = "default_finalize_slack_ms")]
    pub finalize_slack_ms: u64,

    /// RLIMIT_NOFILE for the child
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,

    /// Complete child environment. Nothing is inherited.
    #[serde(default = "default_child_env")]
    pub env: BTreeMap<String, String>,
}

/// One fixed program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Steps behind each fixed maintenance operation, run in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(default = "default_flush_dns")]
    pub flush_dns: Vec<Invocation>,

    #[serde(default = "default_rebuild_search_index")]
    pub rebuild_search_index: Vec<Invocation>,

    #[serde(default = "default_purge_memory")]
    pub purge_memory: Vec<Invocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Overrides `<runtime_dir>/helper.sock`
    #[serde(default)]
    pub socket_path: Option<String>,

    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Peer uids allowed to connect. Empty allows any peer that can open
    /// the socket.
    #[serde(default)]
    pub allowed_peer_uids: Vec<u32>,

    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" | "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Days to keep daemon log files (0 = keep forever)
    #[serde(default)]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions

fn default_true() -> bool {
    true
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_cleanup_roots() -> Vec<String> {
    strings(&[
        "/Library/Caches",
        "/Library/Logs",
        "/private/var/log",
        "~/Library/Caches",
        "~/Library/Logs",
    ])
}

fn default_uninstall_roots() -> Vec<String> {
    strings(&[
        "/Applications",
        "/Library/Application Support",
        "/Library/Caches",
        "/Library/Preferences",
        "/Library/LaunchAgents",
        "/Library/LaunchDaemons",
        "/Library/Logs",
        "~/Library/Application Support",
        "~/Library/Caches",
        "~/Library/Preferences",
        "~/Library/Logs",
        "~/Library/Containers",
        "~/Library/Saved Application State",
    ])
}

fn default_production_commands() -> Vec<String> {
    if cfg!(target_os = "macos") {
        strings(&[
            "/usr/bin/dscacheutil",
            "/usr/bin/killall",
            "/usr/bin/mdutil",
            "/usr/sbin/purge",
        ])
    } else {
        strings(&["/usr/bin/resolvectl", "/usr/bin/updatedb", "/usr/bin/sync"])
    }
}

fn default_test_commands() -> Vec<String> {
    strings(&["/bin/echo", "/bin/sh", "/bin/sleep", "/bin/cat"])
}

fn default_codesign_requirement() -> String {
    "anchor apple".to_string()
}

fn default_codesign_timeout() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_kill_grace_ms() -> u64 {
    200
}

fn default_drain_grace_ms() -> u64 {
    250
}

fn default_finalize_slack_ms() -> u64 {
    1000
}

fn default_max_open_files() -> u64 {
    256
}

fn default_child_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PATH".to_string(), "/usr/bin:/bin:/usr/sbin:/sbin".to_string()),
        ("LANG".to_string(), "C".to_string()),
    ])
}

fn default_flush_dns() -> Vec<Invocation> {
    if cfg!(target_os = "macos") {
        vec![
            Invocation::new("/usr/bin/dscacheutil", &["-flushcache"]),
            Invocation::new("/usr/bin/killall", &["-HUP", "mDNSResponder"]),
        ]
    } else {
        vec![Invocation::new("/usr/bin/resolvectl", &["flush-caches"])]
    }
}

fn default_rebuild_search_index() -> Vec<Invocation> {
    if cfg!(target_os = "macos") {
        vec![Invocation::new("/usr/bin/mdutil", &["-E", "/"])]
    } else {
        vec![Invocation::new("/usr/bin/updatedb", &[])]
    }
}

fn default_purge_memory() -> Vec<Invocation> {
    if cfg!(target_os = "macos") {
        vec![Invocation::new("/usr/sbin/purge", &[])]
    } else {
        vec![Invocation::new("/usr/bin/sync", &[])]
    }
}

fn default_socket_mode() -> u32 {
    0o600
}

fn default_max_request_bytes() -> usize {
    64 * 1024
}

fn default_max_response_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_connections() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            cleanup_roots: default_cleanup_roots(),
            uninstall_roots: default_uninstall_roots(),
            user_home: None,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            production: default_production_commands(),
            test: default_test_commands(),
            pinned_digests: HashMap::new(),
            codesign_requirement: default_codesign_requirement(),
            codesign_timeout_secs: default_codesign_timeout(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            finalize_slack_ms: default_finalize_slack_ms(),
            max_open_files: default_max_open_files(),
            env: default_child_env(),
        }
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            flush_dns: default_flush_dns(),
            rebuild_search_index: default_rebuild_search_index(),
            purge_memory: default_purge_memory(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            socket_mode: default_socket_mode(),
            allowed_peer_uids: Vec::new(),
            max_request_bytes: default_max_request_bytes(),
            max_response_bytes: default_max_response_bytes(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            retention_days: 0, // 0 = keep forever
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `SWEEP_HELPER_CONFIG`, or from
    /// `<config_dir>/config.toml`. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_in(&paths),
        };
        Self::load_from(&path, paths)
    }

    /// Load a specific file with pre-resolved paths.
    pub fn load_from(path: &Path, paths: Paths) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Config::default()
        };
        config.paths = paths;
        config.validate()?;
        Ok(config)
    }

    /// Where `load(None)` looks.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_path_in(&Paths::resolve()?))
    }

    fn config_path_in(paths: &Paths) -> PathBuf {
        std::env::var("SWEEP_HELPER_CONFIG")
            .ok()
            .filter(|v| v.starts_with('/'))
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.config_file())
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.timeout_secs == 0 {
            anyhow::bail!("executor.timeout_secs must be greater than 0");
        }
        if self.executor.max_output_bytes == 0 {
            anyhow::bail!("executor.max_output_bytes must be greater than 0");
        }
        if self.rpc.socket_mode > 0o777 {
            anyhow::bail!("rpc.socket_mode must be a permission mode (<= 0o777)");
        }
        if self.rpc.max_connections == 0 {
            anyhow::bail!("rpc.max_connections must be greater than 0");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be \"text\" or \"json\"");
        }
        self.path_allowlist().map(|_| ())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.rpc
            .socket_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
            .unwrap_or_else(|| self.paths.socket())
    }

    /// Home used to expand `~` in allowlist roots.
    pub fn user_home(&self) -> Option<String> {
        self.allowlist
            .user_home
            .as_deref()
            .map(str::to_string)
            .or_else(|| {
                etcetera::home_dir()
                    .ok()
                    .map(|h| h.to_string_lossy().into_owned())
            })
    }

    /// Normalized root sets. A root that does not normalize is an error.
    pub fn path_allowlist(&self) -> Result<PathAllowlist> {
        let home = self.user_home();
        let cleanup = normalize_roots(&self.allowlist.cleanup_roots, home.as_deref())
            .context("Invalid allowlist.cleanup_roots")?;
        let uninstall = normalize_roots(&self.allowlist.uninstall_roots, home.as_deref())
            .context("Invalid allowlist.uninstall_roots")?;
        Ok(PathAllowlist::new(cleanup, uninstall))
    }

    /// Command set and verifier for the configured environment.
    pub fn command_gate(&self) -> CommandGate {
        let (entries, verifier): (&[String], Arc<dyn SignatureVerifier>) =
            match self.environment.mode {
                EnvironmentMode::Test => (&self.commands.test, Arc::new(AcceptAllVerifier)),
                EnvironmentMode::Production => {
                    (&self.commands.production, self.production_verifier())
                }
            };
        CommandGate::new(CommandAllowlist::new(entries), verifier)
    }

    fn production_verifier(&self) -> Arc<dyn SignatureVerifier> {
        platform_verifier(
            &self.commands.pinned_digests,
            &self.commands.codesign_requirement,
            std::time::Duration::from_secs(self.commands.codesign_timeout_secs),
        )
    }
}

fn normalize_roots(roots: &[String], home: Option<&str>) -> Result<Vec<NormalizedPath>> {
    let mut out = Vec::with_capacity(roots.len());
    for raw in roots {
        let expanded = shellexpand::tilde_with_context(raw, || home);
        let root = normalize(&expanded)
            .ok_or_else(|| anyhow::anyhow!("root {raw:?} is not an absolute directory path"))?;

        if let Ok(canonical) = fs::canonicalize(root.as_path())
            && canonical != root.as_path()
        {
            warn!(
                root = %root,
                canonical = %canonical.display(),
                "allowlist root is not canonical; deletions under it will resolve outside it"
            );
        }
        out.push(root);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::AllowlistScope;

    fn paths(tmp: &tempfile::TempDir) -> Paths {
        Paths::under(tmp.path())
    }

    #[test]
    fn missing_file_gives_defaults_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("config.toml");
        let config = Config::load_from(&file, paths(&tmp)).unwrap();

        assert!(!file.exists());
        assert_eq!(config.environment.mode, EnvironmentMode::Production);
        assert_eq!(config.executor.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.rpc.socket_mode, 0o600);
        assert_eq!(config.executor.env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("config.toml");
        fs::write(
            &file,
            r#"
[environment]
mode = "test"

[executor]
timeout_secs = 5

[rpc]
socket_mode = 0o660
allowed_peer_uids = [501]
"#,
        )
        .unwrap();

        let config = Config::load_from(&file, paths(&tmp)).unwrap();
        assert_eq!(config.environment.mode, EnvironmentMode::Test);
        assert_eq!(config.executor.timeout_secs, 5);
        assert_eq!(config.executor.kill_grace_ms, 200);
        assert_eq!(config.rpc.socket_mode, 0o660);
        assert_eq!(config.rpc.allowed_peer_uids, vec![501]);
        assert!(!config.operations.flush_dns.is_empty());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("config.toml");

        fs::write(&file, "[executor]\ntimeout_secs = 0\n").unwrap();
        assert!(Config::load_from(&file, paths(&tmp)).is_err());

        fs::write(&file, "[allowlist]\ncleanup_roots = [\"relative/dir\"]\n").unwrap();
        let err = Config::load_from(&file, paths(&tmp)).unwrap_err();
        assert!(format!("{err:#}").contains("cleanup_roots"));

        fs::write(&file, "[allowlist]\nuninstall_roots = [\"/\"]\n").unwrap();
        assert!(Config::load_from(&file, paths(&tmp)).is_err());
    }

    #[test]
    fn tilde_roots_expand_against_user_home() {
        let mut config = Config::default();
        config.allowlist.user_home = Some("/Users/alice".to_string());
        config.allowlist.cleanup_roots = vec!["~/Library/Caches/".to_string()];

        let allowlist = config.path_allowlist().unwrap();
        let roots: Vec<&str> = allowlist
            .roots(AllowlistScope::Cleanup)
            .iter()
            .map(|r| r.as_str())
            .collect();
        assert_eq!(roots, vec!["/Users/alice/Library/Caches"]);
    }

    #[test]
    fn test_mode_gate_uses_test_commands() {
        let mut config = Config::default();
        config.environment.mode = EnvironmentMode::Test;
        config.commands.test = vec!["/bin/sh".to_string()];

        let gate = config.command_gate();
        assert_eq!(gate.verifier_description(), "accept-all");
        assert!(gate.check("/bin/sh").is_ok());
    }

    #[test]
    fn production_gate_uses_configured_verifier() {
        let mut config = Config::default();
        config.environment.mode = EnvironmentMode::Production;
        config.commands.codesign_requirement = "anchor apple generic".to_string();

        let gate = config.command_gate();
        if cfg!(target_os = "macos") {
            assert_eq!(gate.verifier_description(), "codesign (anchor apple generic)");
        } else {
            assert_eq!(gate.verifier_description(), "sha256 pins (0 binaries)");
        }

        config
            .commands
            .pinned_digests
            .insert("/bin/sh".to_string(), "00".repeat(32));
        assert_eq!(
            config.command_gate().verifier_description(),
            "sha256 pins (1 binaries)"
        );
    }

    #[test]
    fn socket_path_defaults_to_runtime_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config {
            paths: paths(&tmp),
            ..Config::default()
        };
        assert_eq!(config.socket_path(), tmp.path().join("run/helper.sock"));

        config.rpc.socket_path = Some("/var/run/custom.sock".to_string());
        assert_eq!(config.socket_path(), PathBuf::from("/var/run/custom.sock"));
    }

    #[test]
    fn effective_config_serializes_to_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("[executor]"));
        assert!(text.contains("cleanup_roots"));
    }
}
