use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

use sweep_helper::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (file merged over defaults)
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,
}

pub fn run(args: ConfigArgs, config: &Config, explicit: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config, &format),
        ConfigCommands::Path => show_path(explicit),
    }
}

fn show_config(config: &Config, format: &str) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn show_path(explicit: Option<&Path>) -> Result<()> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    let note = if path.exists() { "" } else { " (not present, using defaults)" };
    println!("{}{}", path.display(), note);
    Ok(())
}
