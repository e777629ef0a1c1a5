use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hearsay::{Cluster, ClusterConfigBuilder};
use log::{error, info};
use tokio::time;

#[derive(Parser, Debug)]
#[command(name = "hearsay", about = "Gossip-style cluster membership over UDP")]
struct Args {
    /// Initial peer to contact, as host[:port].
    #[arg(long)]
    node: Option<String>,

    /// The bind port.
    #[arg(long, default_value_t = 9999)]
    port: u16,

    /// The heartbeat frequency in milliseconds.
    #[arg(long = "hbf", default_value_t = 500)]
    heartbeat_millis: u32,

    /// Stop the process after this many minutes (0 = run until signalled).
    #[arg(long, default_value_t = 0)]
    stop: u64,

    /// Minimum log severity (off, error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .init();

    let mut builder = ClusterConfigBuilder::new()
        .port(args.port)
        .heartbeat_millis(args.heartbeat_millis)
        .log_threshold(args.log_level);
    if let Some(node) = &args.node {
        builder = builder.initial_host(node.clone());
    }
    let config = builder.build()?;

    let cluster = Cluster::new(config)?;

    let runner = cluster.clone();
    let handle = tokio::spawn(async move { runner.start().await });

    if args.stop > 0 {
        let stopper = cluster.clone();
        let minutes = args.stop;
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(minutes * 60)).await;
            info!("Scheduled stop after {} minute(s)", minutes);
            if let Err(e) = stopper.stop().await {
                error!("Failed to stop cluster: {}", e);
            }
        });
    }

    let signal_cluster = cluster.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Signal received, stopping cluster...");
            let _ = signal_cluster.stop().await;
        }
    });

    if let Err(e) = handle.await? {
        error!("[HEARSAY] {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
