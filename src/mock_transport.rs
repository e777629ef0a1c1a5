use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::transport::{DatagramEnvelope, DatagramTransport, TransportChannel};

/// Capture-only transport for tests: records every outbound datagram and
/// exposes the dispatcher channel sender so tests can inject inbound ones.
pub(crate) struct MockTransport {
    ip: Ipv4Addr,
    port: u16,
    sent: Arc<Mutex<Vec<(SocketAddrV4, Vec<u8>)>>>,
    datagram_tx: mpsc::Sender<DatagramEnvelope>,
}

impl MockTransport {
    pub(crate) fn new(ip: Ipv4Addr, port: u16) -> (Self, TransportChannel) {
        let (datagram_tx, datagram_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);

        (
            Self {
                ip,
                port,
                sent: Arc::new(Mutex::new(Vec::new())),
                datagram_tx,
            },
            TransportChannel { datagram_rx },
        )
    }

    pub(crate) fn sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().clear();
    }

    #[allow(dead_code)]
    pub(crate) fn injector(&self) -> mpsc::Sender<DatagramEnvelope> {
        self.datagram_tx.clone()
    }
}

#[async_trait]
impl DatagramTransport for MockTransport {
    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn listen_port(&self) -> u16 {
        self.port
    }

    async fn bind_socket(&self) -> Result<()> {
        Ok(())
    }

    async fn socket_listener(&self) -> Result<()> {
        // No socket to read; inbound traffic is injected by the test.
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn send_datagram(&self, target: SocketAddrV4, payload: &[u8]) -> Result<()> {
        self.sent.lock().push((target, payload.to_vec()));
        Ok(())
    }
}
