//! qfleet daemon entry point.

use clap::{Parser, Subcommand};
use qfleet::{
    bootstrap, Fleet, FleetConfig, FleetEvent, LocalImageRegistry, NoopNetworkManager,
    SystemQemuLauncher,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// qfleet - QEMU VM fleet controller
#[derive(Parser, Debug)]
#[command(name = "qfleet")]
#[command(about = "QEMU VM fleet controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller daemon
    Serve {
        /// Override the root directory for state and instances
        #[arg(long)]
        root: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { root } => serve(root).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn serve(root: Option<std::path::PathBuf>) -> qfleet::Result<()> {
    let mut config = FleetConfig::load()?;
    if let Some(root) = root {
        config.image_dir = root.join("images");
        config.root_dir = root;
    }
    std::fs::create_dir_all(&config.image_dir)?;

    tracing::info!(
        version = qfleet::VERSION,
        root = %config.root_dir.display(),
        "starting qfleet"
    );

    let network = Arc::new(NoopNetworkManager);
    let Fleet {
        manager,
        mut events,
        lifecycle_task,
    } = bootstrap(
        &config,
        Arc::new(SystemQemuLauncher::new(
            &config.qemu_binary,
            config.instances_dir(),
            network.clone(),
        )),
        Arc::new(LocalImageRegistry::new(&config.image_dir)),
        network,
    )
    .await?;

    // Surface fleet events in the daemon log until an RPC edge is wired
    // on top.
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                FleetEvent::VmUpdated(info) => {
                    tracing::info!(instance = %info.name, state = %info.state, "vm updated");
                }
                FleetEvent::VmRemoved { name } => {
                    tracing::info!(instance = %name, "vm removed");
                }
                FleetEvent::Error { message, resource } => {
                    tracing::warn!(resource = %resource, "{}", message);
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    manager.shutdown();
    let _ = lifecycle_task.await;
    event_log.abort();

    Ok(())
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qfleet=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
