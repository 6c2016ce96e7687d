use clap::Parser;
use rv_coordinator::Coordinator;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Network coordinator for the RV device-automation fabric.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a TOML config file. Missing is fine — every setting has a
    /// default.
    #[arg(long, default_value = "coordinator.toml")]
    config: PathBuf,

    /// Log level floor when `RUST_LOG` isn't set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match rv_coordinator::config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "failed to load configuration, exiting");
            std::process::exit(1);
        }
    };

    let coordinator = Coordinator::new(config);
    tracing::info!(server_ip = %coordinator.server_ip(), "starting rv-coordinator");

    let run = coordinator.run();
    tokio::pin!(run);

    tokio::select! {
        () = &mut run => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            coordinator.stop();
            run.await;
        }
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
