//! Modem Service (modemsrv)

use clap::Parser;
use tracing::info;

use modemsrv::core::bootstrap::{self, Args};
use modemsrv::facade::log_events;
use modemsrv::{wait_for_shutdown, DriverRegistry, ModemService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = bootstrap::load_configuration(&args)?;
    bootstrap::initialize_logging(&args, &config)?;
    info!(
        "Starting {} v{}",
        config.service.name,
        env!("CARGO_PKG_VERSION")
    );

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::validate_configuration(&config)?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let registry = DriverRegistry::with_defaults();
    let service = ModemService::start(&config, &registry, log_events()).await?;

    wait_for_shutdown(service.token()).await;
    service.shutdown().await;

    info!("Service stopped");
    Ok(())
}
