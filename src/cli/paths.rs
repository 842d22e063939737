//! CLI subcommand: `sweep-helper paths`
//!
//! Prints all resolved paths for debugging and scripting.

use anyhow::Result;

use sweep_helper::Config;

pub fn run(config: &Config) -> Result<()> {
    let paths = &config.paths;
    let kind = if paths.system { "system" } else { "user" };

    println!("sweep-helper Paths ({kind})");
    println!("========================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!();
    println!("Runtime:    {}", paths.runtime_dir.display());
    println!("  socket:         {}", config.socket_path().display());
    println!("  PID file:       {}", paths.pid_file().display());
    println!("  instance lock:  {}", paths.instance_lock().display());

    Ok(())
}
