//! CLI binary entry point for a Phonendo mesh node.
//!
//! Usage:
//!   phonendo-node [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Path to configuration TOML file
//!   -r, --role <ROLE>         Role to play (overrides config)
//!   -l, --listen <ADDR>       P2P listen address (overrides config)
//!   -b, --bootstrap <ADDR>    Bootstrap peer multiaddress (repeatable)
//!   -v, --verbose             Increase logging verbosity
//!   --service-name <NAME>     Label used in logs

use std::path::PathBuf;

use clap::Parser;

use phonendo_node::config::NodeConfig;
use phonendo_node::node::PhonendoNode;
use phonendo_protocol::Role;

/// Phonendo node - one role of the capture/verify/publish mesh.
#[derive(Parser, Debug)]
#[command(name = "phonendo-node")]
#[command(about = "Phonendo mesh node: manager, storage, verifier, publisher or reader")]
#[command(version)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, value_name = "FILE", default_value = "config/phonendo.toml")]
    config: PathBuf,

    /// Role to play (manager, storage, verifier, publisher, reader).
    #[arg(short, long, value_name = "ROLE")]
    role: Option<Role>,

    /// P2P listen address (e.g., /ip4/0.0.0.0/tcp/9000).
    #[arg(short, long, value_name = "MULTIADDR")]
    listen: Option<String>,

    /// Bootstrap peer multiaddress (can be specified multiple times).
    #[arg(short, long, value_name = "MULTIADDR")]
    bootstrap: Vec<String>,

    /// Increase logging verbosity (can be repeated: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Label used in start and stop logs.
    #[arg(long, value_name = "NAME")]
    service_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(Some(cli.config.as_path()))?;

    if let Some(role) = cli.role {
        config.node.role = role;
    }
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }
    if !cli.bootstrap.is_empty() {
        config.network.bootstrap_peers = cli.bootstrap;
    }
    if let Some(name) = cli.service_name {
        config.node.service_name = Some(name);
    }

    let log_level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if config.logging.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    let service = config.service_name();
    tracing::info!(
        service = %service,
        role = %config.node.role,
        listen = %config.network.listen_addr,
        "Starting {service}"
    );

    let node = PhonendoNode::new(config).await?;
    let handle = node.handle();
    let node_task = tokio::spawn(node.run());

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    if let Err(e) = handle.shutdown().await {
        tracing::debug!(error = %e, "Swarm host already stopped");
    }
    match node_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Node stopped with an error"),
        Err(e) => tracing::error!(error = %e, "Node task failed"),
    }

    tracing::info!("{service} has stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
