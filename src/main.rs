use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portfwd::{Cli, Forwarder};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let config = Cli::parse().into_config().context("invalid arguments")?;
    init_tracing(config.verbose);

    info!(
        port = config.listen.port(),
        remote = %config.remote,
        max = config.max_connections,
        "forwarding"
    );

    let forwarder = Forwarder::new(&config).context("failed to start forwarder")?;
    forwarder.install_signal_handlers()?;

    let report = forwarder.run()?;
    info!(
        slots = report.slots_released,
        sockets = report.sockets_closed,
        "shut down cleanly"
    );
    Ok(())
}
