//! atom-router - CLI entry point

use atom_router::{Config, Router, VERSION};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "atom-router")]
#[command(version = VERSION)]
#[command(about = "Authenticating HTTP/1.1 reverse-proxy router")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "router.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Listen port (overrides config)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Database file (overrides config)
    #[arg(long = "database")]
    database: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("atom-router-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atom_router=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("atom-router v{}", VERSION);
    info!("Loading configuration from: {}", args.config.display());

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database = database;
    }

    // Test mode
    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let router = match Router::new(config) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to initialize router: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = router.run().await {
        error!("Router error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
