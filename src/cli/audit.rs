use anyhow::{Result, bail};
use clap::{Args, Subcommand};

use sweep_helper::Config;
use sweep_helper::security::{read_audit_log, verify_audit_chain};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print the most recent entries
    Show {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Check the hash chain
    Verify,
}

pub fn run(args: AuditArgs, config: &Config) -> Result<()> {
    let state_dir = &config.paths.state_dir;
    match args.command {
        AuditCommands::Show { limit, json } => {
            let entries = read_audit_log(state_dir)?;
            let skip = entries.len().saturating_sub(limit);
            for entry in &entries[skip..] {
                if json {
                    println!("{}", serde_json::to_string(entry)?);
                } else {
                    println!(
                        "{}  {:<20}  {:<22}  {:<20}  {}",
                        entry.ts,
                        serde_json::to_value(entry.action)?
                            .as_str()
                            .unwrap_or_default(),
                        entry.outcome,
                        entry.source,
                        entry.detail.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        AuditCommands::Verify => {
            let entries = read_audit_log(state_dir)?;
            let broken = verify_audit_chain(state_dir)?;
            if broken.is_empty() {
                println!("Audit chain intact ({} entries)", entries.len());
                Ok(())
            } else {
                let lines: Vec<String> = broken.iter().map(|i| (i + 1).to_string()).collect();
                bail!("Audit chain broken at line(s) {}", lines.join(", "))
            }
        }
    }
}
