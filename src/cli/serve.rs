use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use sweep_helper::Config;
use sweep_helper::server::{HelperService, RpcServer};

/// Build the service from `config` and serve until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    config.paths.ensure_dirs()?;

    let service = Arc::new(HelperService::from_config(&config)?);
    let gate = service.executor().gate();
    info!(
        mode = ?config.environment.mode,
        verifier = %gate.verifier_description(),
        commands = gate.allowlist().len(),
        "starting sweep-helper {}",
        service.version()
    );

    let server = RpcServer::bind(service, &config)?;
    server.run().await
}
