use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use stubns::cli::{CliOpts, Commands, SharedOpts};
use stubns::config::ConfigFile;
use stubns::forwarder::ForwardResolver;
use stubns::logging::setup_logging;
use stubns::resolver::Resolver;
use stubns::servers::start_stub;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let opts = CliOpts::parse();

    match opts.command {
        Commands::Server { sopt } => server(sopt).await,
        Commands::ConfigCheck { sopt } => config_check(sopt).await,
        Commands::ExportConfig { sopt } => export_config(sopt).await,
    }
}

async fn server(sopt: SharedOpts) -> Result<(), std::io::Error> {
    let config = ConfigFile::try_as_cowcell(sopt.config.as_ref())?;

    if let Err(errors) = ConfigFile::check_config(config.write().await).await {
        for error in errors {
            eprintln!("{error}");
        }
        return Err(std::io::Error::other("Configuration check failed"));
    }

    let config_reader = config.read().await;
    setup_logging(&config_reader.log_level, sopt.debug)?;
    info!("Starting with config: {}", *config_reader);

    let Some(upstream) = config_reader.upstream_address().map_err(std::io::Error::from)? else {
        error!("No upstream server configured, set \"upstream\" in the configuration file.");
        return Err(std::io::Error::other("no upstream server configured"));
    };
    let resolver: Arc<dyn Resolver> = Arc::new(ForwardResolver::new(upstream));

    let servers = start_stub(config.read().await, resolver)
        .await
        .map_err(std::io::Error::from)?;
    if servers.is_empty() {
        warn!("No listeners came up, nothing to serve.");
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down.");
    servers.stop();
    Ok(())
}

async fn config_check(sopt: SharedOpts) -> Result<(), std::io::Error> {
    let config = ConfigFile::try_as_cowcell(sopt.config.as_ref())?;
    match ConfigFile::check_config(config.write().await).await {
        Ok(()) => {
            println!("Config check OK");
            Ok(())
        }
        Err(errors) => {
            for error in errors {
                eprintln!("{error}");
            }
            Err(std::io::Error::other("Configuration check failed"))
        }
    }
}

async fn export_config(sopt: SharedOpts) -> Result<(), std::io::Error> {
    let config = ConfigFile::try_as_cowcell(sopt.config.as_ref())?;
    let reader = config.read().await;
    let json = reader
        .as_json_pretty()
        .map_err(std::io::Error::from)?;
    println!("{json}");
    Ok(())
}
