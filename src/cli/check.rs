//! CLI subcommand: `sweep-helper check`
//!
//! Dry-run of the allowlist decisions the helper would make. Nothing is
//! deleted or executed.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use std::path::Path;

use super::ScopeArg;
use sweep_helper::Config;
use sweep_helper::security::AllowlistScope;

#[derive(Args)]
pub struct CheckArgs {
    #[command(subcommand)]
    pub command: CheckCommands,
}

#[derive(Subcommand)]
pub enum CheckCommands {
    /// Would `delete` accept this path?
    Path {
        path: String,

        #[arg(long, value_enum, default_value_t)]
        scope: ScopeArg,
    },

    /// Would `run` accept this executable?
    Command { name: String },
}

pub fn run(args: CheckArgs, config: &Config) -> Result<()> {
    match args.command {
        CheckCommands::Path { path, scope } => check_path(config, &path, scope.into()),
        CheckCommands::Command { name } => check_command(config, &name),
    }
}

fn check_path(config: &Config, raw: &str, scope: AllowlistScope) -> Result<()> {
    let allowlist = config.path_allowlist()?;
    let target = match allowlist.check_target(raw, scope) {
        Ok(target) => target,
        Err(e) => bail!("{}: {}", e.code(), e),
    };

    let (parent, _) = target.split_parent();
    match std::fs::canonicalize(parent) {
        Ok(resolved) if allowlist.is_parent_allowed(&resolved, scope) => {
            println!("allowed ({scope}): {target}");
            Ok(())
        }
        Ok(resolved) => bail!(
            "SymlinkEscape: parent {} resolves to {}",
            parent,
            resolved.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("allowed ({scope}): {target} (parent does not exist yet)");
            Ok(())
        }
        Err(e) => bail!("cannot resolve {}: {}", Path::new(parent).display(), e),
    }
}

fn check_command(config: &Config, name: &str) -> Result<()> {
    let gate = config.command_gate();
    match gate.check(name) {
        Ok(vetted) => {
            println!(
                "allowed: {} -> {} (verified by {})",
                vetted.requested.display(),
                vetted.canonical.display(),
                gate.verifier_description()
            );
            Ok(())
        }
        Err(e) => bail!("{}: {}", e.code(), e),
    }
}
