use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use sweep_helper::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Daemon start/restart must fork BEFORE the Tokio runtime starts
    if let Commands::Daemon(ref args) = cli.command {
        match args.command {
            cli::daemon::DaemonCommands::Start { foreground: false } => {
                let config = Config::load(cli.config.as_deref())?;
                return cli::daemon::daemonize_and_run(config, cli.verbose);
            }
            cli::daemon::DaemonCommands::Restart { foreground: false } => {
                let config = Config::load(cli.config.as_deref())?;
                cli::daemon::stop_sync(&config)?;
                return cli::daemon::daemonize_and_run(config, cli.verbose);
            }
            _ => {}
        }
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Logging comes up even when the config is broken so the error is seen
    let loaded = Config::load(cli.config.as_deref());
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    cli::init_logging(&logging, cli.verbose, true);
    let config = loaded?;

    match cli.command {
        Commands::Serve => cli::serve::run(config).await,
        Commands::Daemon(args) => cli::daemon::run(args, config).await,
        Commands::Client(args) => cli::client::run(args, &config).await,
        Commands::Check(args) => cli::check::run(args, &config),
        Commands::Paths => cli::paths::run(&config),
        Commands::Config(args) => cli::config::run(args, &config, cli.config.as_deref()),
        Commands::Audit(args) => cli::audit::run(args, &config),
    }
}
