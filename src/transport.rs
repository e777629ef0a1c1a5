use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{error, trace};
use parking_lot::RwLock;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::mpsc;

use crate::config::{DEFAULT_CHANNEL_BUFFER_SIZE, MAX_DATAGRAM_BYTES};

/// A raw inbound datagram: source address plus payload bytes.
pub(crate) type DatagramEnvelope = (SocketAddr, Vec<u8>);

/// The socket pair the protocol core runs against: a bound listener feeding
/// the dispatcher channel, and a per-datagram ephemeral sender.
#[async_trait]
pub(crate) trait DatagramTransport: Send + Sync {
    /// The IP this endpoint advertises.
    fn local_ip(&self) -> Ipv4Addr;

    /// The actually bound port. Before binding, the configured port.
    fn listen_port(&self) -> u16;

    async fn bind_socket(&self) -> Result<()>;

    /// Releases the listening socket once the listener loop has exited.
    fn unbind_socket(&self) {}

    /// Blocks reading datagrams and forwarding them into the dispatcher
    /// channel. Returns only on socket failure.
    async fn socket_listener(&self) -> Result<()>;

    async fn send_datagram(&self, target: SocketAddrV4, payload: &[u8]) -> Result<()>;
}

/// Receiving half handed to the dispatcher.
pub(crate) struct TransportChannel {
    pub(crate) datagram_rx: mpsc::Receiver<DatagramEnvelope>,
}

/// Real UDP transport. The listening socket is acquired at bind time and
/// held for the life of the listener loop; outbound sends each use a scoped
/// ephemeral socket bound to the advertised IP so the receiver's view of our
/// identity matches the source address.
#[derive(Clone)]
pub(crate) struct UdpTransport {
    ip: Ipv4Addr,
    port: u16,
    socket: Arc<RwLock<Option<Arc<TokioUdpSocket>>>>,
    bound_port: Arc<RwLock<Option<u16>>>,
    datagram_tx: mpsc::Sender<DatagramEnvelope>,
}

impl UdpTransport {
    pub(crate) fn new(ip: Ipv4Addr, port: u16) -> (Self, TransportChannel) {
        let (datagram_tx, datagram_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);

        (
            Self {
                ip,
                port,
                socket: Arc::new(RwLock::new(None)),
                bound_port: Arc::new(RwLock::new(None)),
                datagram_tx,
            },
            TransportChannel { datagram_rx },
        )
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn listen_port(&self) -> u16 {
        self.bound_port.read().unwrap_or(self.port)
    }

    async fn bind_socket(&self) -> Result<()> {
        let bind_addr = SocketAddrV4::new(self.ip, self.port);
        let socket = TokioUdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", bind_addr))?;

        let actual = socket.local_addr()?.port();
        *self.bound_port.write() = Some(actual);
        *self.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    fn unbind_socket(&self) {
        *self.socket.write() = None;
    }

    async fn socket_listener(&self) -> Result<()> {
        let socket = self
            .socket
            .read()
            .as_ref()
            .ok_or_else(|| anyhow!("UDP socket not initialized"))?
            .clone();

        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    trace!("[RECV] Incoming UDP datagram from: {}", addr);
                    if let Err(e) = self.datagram_tx.send((addr, buf[..len].to_vec())).await {
                        error!("Failed to send datagram to dispatcher channel: {:?}", e);
                    }
                }
                Err(e) => error!("Failed to receive UDP datagram: {:?}", e),
            }
        }
    }

    async fn send_datagram(&self, target: SocketAddrV4, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(anyhow!(
                "datagram too large, allowed {} bytes but got {} bytes",
                MAX_DATAGRAM_BYTES,
                payload.len()
            ));
        }

        // Scoped sender socket, released on every exit path.
        let socket = TokioUdpSocket::bind(SocketAddrV4::new(self.ip, 0))
            .await
            .context("failed to bind ephemeral sender socket")?;

        socket
            .send_to(payload, target)
            .await
            .with_context(|| format!("failed to send datagram to {}", target))?;

        Ok(())
    }
}
