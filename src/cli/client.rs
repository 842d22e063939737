use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use super::ScopeArg;
use sweep_helper::Config;
use sweep_helper::server::{HelperClient, Request, Response};

#[derive(Args)]
pub struct ClientArgs {
    /// Socket to connect to (default: from config)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Print the raw reply as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: ClientCommands,
}

#[derive(Subcommand)]
pub enum ClientCommands {
    /// Flush the DNS resolver cache
    FlushDns,

    /// Rebuild the search index
    RebuildSearchIndex,

    /// Purge inactive memory
    PurgeMemory,

    /// Delete one file or empty directory inside an allowed root
    Delete {
        path: String,

        #[arg(long, value_enum, default_value_t)]
        scope: ScopeArg,
    },

    /// Run an allowlisted command
    Run {
        /// Absolute path of the executable
        name: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the helper's version
    Version,
}

impl ClientCommands {
    fn into_request(self) -> Request {
        match self {
            ClientCommands::FlushDns => Request::FlushDns,
            ClientCommands::RebuildSearchIndex => Request::RebuildSearchIndex,
            ClientCommands::PurgeMemory => Request::PurgeMemory,
            ClientCommands::Delete { path, scope } => Request::DeleteFile {
                path,
                scope: scope.into(),
            },
            ClientCommands::Run { name, args } => Request::RunCommand {
                name,
                arguments: args,
            },
            ClientCommands::Version => Request::GetVersion,
        }
    }
}

pub async fn run(args: ClientArgs, config: &Config) -> Result<()> {
    let socket = args.socket.unwrap_or_else(|| config.socket_path());
    let mut client = HelperClient::connect_with(&socket, &config.rpc).await?;
    let response = client.call(args.command.into_request()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return match response.error() {
            Some(code) => bail!("request failed: {code}"),
            None => Ok(()),
        };
    }

    match response {
        Response::Version { version } => println!("{}", version),
        Response::Status(reply) => {
            if let Some(execution) = &reply.execution {
                std::io::stdout().write_all(&execution.stdout)?;
                std::io::stderr().write_all(&execution.stderr)?;
                if execution.stdout_truncated || execution.stderr_truncated {
                    eprintln!("(output truncated)");
                }
            }
            if !reply.success {
                let code = reply
                    .error
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "Unknown".to_string());
                bail!("{}: {}", code, reply.message);
            }
            println!("{}", reply.message);
        }
    }

    Ok(())
}
