use log::{error, info};
use tokio::select;
use tokio::sync::broadcast;

use crate::transport::TransportChannel;
use crate::Cluster;

/// Drains the transport channel and hands each datagram to an independently
/// spawned handler, so one slow handler never blocks packet intake.
pub(crate) struct ClusterListener {
    cluster: Cluster,
    transport_channel: TransportChannel,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ClusterListener {
    pub(crate) fn new(
        cluster: Cluster,
        transport_channel: TransportChannel,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            cluster,
            transport_channel,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(&mut self) {
        info!("Starting datagram dispatcher....");

        loop {
            select! {
                datagram = self.transport_channel.datagram_rx.recv() => {
                    match datagram {
                        Some((addr, bytes)) => {
                            let cluster = self.cluster.clone();
                            tokio::spawn(async move {
                                if let Err(e) = cluster.handle_datagram(addr, bytes).await {
                                    error!("Error handling datagram from {}: {:?}", addr, e);
                                }
                            });
                        }
                        None => break,
                    }
                },
                _ = self.shutdown_rx.recv() => {
                    info!("[RECV] Shutdown signal received, stopping dispatcher");
                    break;
                }
            }
        }
    }
}
