use anyhow::Result;
use clap::{Args, Subcommand};
use daemonize::Daemonize;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sweep_helper::Config;
use sweep_helper::server::HelperClient;

#[derive(Args)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommands,
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the helper
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the helper
    Stop,

    /// Restart the helper (stop then start)
    Restart {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Show helper status
    Status,
}

pub async fn run(args: DaemonArgs, config: Config) -> Result<()> {
    match args.command {
        DaemonCommands::Start { foreground } => start_daemon(foreground, config).await,
        DaemonCommands::Stop => stop_sync(&config),
        DaemonCommands::Restart { foreground } => {
            stop_sync(&config)?;
            start_daemon(foreground, config).await
        }
        DaemonCommands::Status => show_status(&config).await,
    }
}

/// Synchronously stop the helper (for use before the Tokio runtime starts)
pub fn stop_sync(config: &Config) -> Result<()> {
    let pid_file = config.paths.pid_file();
    let Some(pid) = read_pid(&pid_file) else {
        println!("Helper is not running");
        return Ok(());
    };

    if !is_process_running(pid) {
        println!("Helper is not running (stale PID file)");
        fs::remove_file(&pid_file).ok();
        return Ok(());
    }

    println!("Stopping helper (PID: {})...", pid);
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)?;

    // Wait for process to stop (up to 5 seconds)
    for _ in 0..50 {
        if !is_process_running(pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if is_process_running(pid) {
        anyhow::bail!("Failed to stop helper (PID: {})", pid);
    }

    println!("Helper stopped");
    fs::remove_file(&pid_file).ok();
    Ok(())
}

/// Fork and daemonize BEFORE starting the Tokio runtime.
pub fn daemonize_and_run(config: Config, verbose: bool) -> Result<()> {
    config.paths.ensure_dirs()?;
    let pid_file = config.paths.pid_file();
    refuse_if_running(&pid_file)?;

    let log_file = get_log_file(&config.paths.logs_dir(), config.logging.retention_days)?;

    println!("Starting sweep-helper in background...");
    println!("  PID file: {}", pid_file.display());
    println!("  Log file: {}", log_file.display());
    println!("  Socket:   {}", config.socket_path().display());
    println!("\nUse 'sweep-helper daemon status' to check status");
    println!("Use 'sweep-helper daemon stop' to stop\n");

    // Append so restarts on the same day keep earlier output
    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .pid_file(&pid_file)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => {
            // In the child: safe to start Tokio now
            crate::cli::init_logging(&config.logging, verbose, false);
            let result = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(crate::cli::serve::run(config));
            fs::remove_file(&pid_file).ok();
            result
        }
        Err(e) => anyhow::bail!("Failed to daemonize: {}", e),
    }
}

async fn start_daemon(foreground: bool, config: Config) -> Result<()> {
    // Background mode is handled by daemonize_and_run() before Tokio starts
    if !foreground {
        anyhow::bail!("Background mode must be started before the async runtime");
    }

    config.paths.ensure_dirs()?;
    let pid_file = config.paths.pid_file();
    refuse_if_running(&pid_file)?;

    println!("Starting sweep-helper in foreground...");
    fs::write(&pid_file, std::process::id().to_string())?;

    let result = crate::cli::serve::run(config).await;

    println!("\nShutting down...");
    fs::remove_file(&pid_file).ok();
    result
}

async fn show_status(config: &Config) -> Result<()> {
    let pid = read_pid(&config.paths.pid_file()).filter(|pid| is_process_running(*pid));
    let socket = config.socket_path();

    println!("sweep-helper Status");
    println!("-------------------");
    println!("Running: {}", if pid.is_some() { "yes" } else { "no" });
    if let Some(pid) = pid {
        println!("PID: {}", pid);
    }
    println!("Socket: {}", socket.display());

    match HelperClient::connect_with(&socket, &config.rpc).await {
        Ok(mut client) => match client.get_version().await {
            Ok(version) => println!("Responding: yes (version {})", version),
            Err(e) => println!("Responding: no ({})", e),
        },
        Err(_) => println!("Responding: no"),
    }

    println!("\nConfiguration:");
    println!("  Mode: {:?}", config.environment.mode);
    println!("  Timeout: {}s", config.executor.timeout_secs);
    println!(
        "  Allowed peers: {}",
        if config.rpc.allowed_peer_uids.is_empty() {
            "any".to_string()
        } else {
            format!("{:?}", config.rpc.allowed_peer_uids)
        }
    );

    Ok(())
}

fn refuse_if_running(pid_file: &Path) -> Result<()> {
    if let Some(pid) = read_pid(pid_file) {
        if is_process_running(pid) {
            anyhow::bail!("Helper already running (PID: {})", pid);
        }
        fs::remove_file(pid_file)?;
    }
    Ok(())
}

fn read_pid(pid_file: &Path) -> Option<i32> {
    fs::read_to_string(pid_file).ok()?.trim().parse().ok()
}

fn get_log_file(logs_dir: &Path, retention_days: u32) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir)?;

    // Prune old logs only if retention_days > 0
    if retention_days > 0 {
        prune_old_logs(logs_dir, retention_days as i64);
    }

    let date = chrono::Local::now().format("%Y-%m-%d");
    Ok(logs_dir.join(format!("sweep-helper-{}.log", date)))
}

/// Prune log files older than `keep_days` days
fn prune_old_logs(logs_dir: &Path, keep_days: i64) {
    let cutoff = chrono::Local::now() - chrono::Duration::days(keep_days);
    let cutoff_date = cutoff.format("%Y-%m-%d").to_string();

    if let Ok(entries) = fs::read_dir(logs_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            // Match sweep-helper-YYYY-MM-DD.log
            if let Some(date_part) = name_str
                .strip_prefix("sweep-helper-")
                .and_then(|s| s.strip_suffix(".log"))
                && date_part < cutoff_date.as_str()
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn is_process_running(pid: i32) -> bool {
    pid > 0 && signal::kill(Pid::from_raw(pid), None).is_ok()
}
