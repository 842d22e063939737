pub mod audit;
pub mod check;
pub mod client;
pub mod config;
pub mod daemon;
pub mod paths;
pub mod serve;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use sweep_helper::config::LoggingConfig;
use sweep_helper::security::AllowlistScope;

#[derive(Parser)]
#[command(name = "sweep-helper")]
#[command(
    author,
    version,
    about = "Privileged maintenance helper for allowlisted deletion and command execution"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "SWEEP_HELPER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the helper in the foreground (launchd / systemd)
    Serve,

    /// Manage the background helper
    Daemon(daemon::DaemonArgs),

    /// Send a request to a running helper
    Client(client::ClientArgs),

    /// Evaluate a path or command against the allowlists without acting
    Check(check::CheckArgs),

    /// Show resolved directory paths
    Paths,

    /// Configuration inspection
    Config(config::ConfigArgs),

    /// Audit log inspection
    Audit(audit::AuditArgs),
}

/// Root set selector for `--scope`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    #[default]
    Cleanup,
    Uninstall,
}

impl From<ScopeArg> for AllowlistScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Cleanup => AllowlistScope::Cleanup,
            ScopeArg::Uninstall => AllowlistScope::Uninstall,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`, which
/// wins over the configured level. ANSI is off when writing to a log file.
pub fn init_logging(logging: &LoggingConfig, verbose: bool, ansi: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(ansi)
            .with_writer(std::io::stderr)
            .init();
    }
}
