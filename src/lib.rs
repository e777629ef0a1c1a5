use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::*;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::broadcast_queue::BroadcastBuffer;
use crate::clock::MonotonicClock;
use crate::codec::MessageCodec;
use crate::config::{
    TIMEOUT_SWEEP_MILLIS, TIMEOUT_TOLERANCE_SIGMAS, RTT_SEED_MILLIS, RTT_WINDOW_CAPACITY,
};
use crate::ip_addr::parse_node_address;
use crate::listener::ClusterListener;
use crate::listener_backoff::ListenerBackoff;
use crate::members::{DeadNodeDecision, Membership, StatusChange};
use crate::message::{BroadcastFrame, MemberRecord, Message, Verb};
use crate::pending::{AckKey, PendingAck, PendingAckTable, ProbeKind};
use crate::ping_data::PingData;
use crate::state::WireStatus;
use crate::transport::{DatagramTransport, TransportChannel, UdpTransport};

mod broadcast_queue;
mod clock;
mod codec;
pub mod config;
mod event_handler;
mod ip_addr;
mod listener;
mod listener_backoff;
mod members;
mod message;
#[cfg(test)]
mod mock_transport;
mod node;
mod pending;
mod ping_data;
mod state;
mod transport;

pub use broadcast_queue::ReceivedBroadcast;
pub use config::{ClusterConfig, ClusterConfigBuilder};
pub use event_handler::ClusterEventHandler;
pub use ip_addr::IpAddress;
pub use node::{Node, PingDuration};
pub use state::NodeStatus;

/// # SWIM-style gossip membership for HEARSAY
///
/// Each endpoint probes one random peer per heartbeat with a `PING`. A probe
/// that misses its adaptive deadline fans out `PINGREQ`s to a handful of
/// live peers, which relay a non-forwarding ping (`NFP`) to the suspect and
/// relay its `ACK` back. A peer failing both paths is declared dead, the
/// transition rides along on routine probe traffic until its emit counter
/// drains, and the dead peer is eventually evicted after exponentially
/// backed-off re-probes.
///
/// The moving parts:
///
/// * `Cluster`: protocol handler owning the probe loop, the timeout sweep
///   and the verb handlers.
/// * `Membership`: concurrent registry of peers, the recently-updated set
///   that drives piggybacked dissemination, and dead-node retry counters.
/// * `PendingAckTable`: outstanding probes keyed by (peer, heartbeat), so a
///   late ACK for an earlier probe can never satisfy a later one.
/// * `PingData`: rolling RTT statistics; ack deadlines are mean plus three
///   standard deviations, so timeouts track the network we actually have.
/// * `Transport` / `ClusterListener`: a bound UDP socket feeding a channel,
///   with one spawned handler per datagram.
pub struct Cluster {
    inner: Arc<InnerCluster>,
}

enum ClusterState {
    Idle,
    Running,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ShutdownReason {
    Termination,
    ListenerFailure,
    DetectorFailure,
    TimeoutCheckerFailure,
}

pub(crate) struct InnerCluster {
    /// Configuration settings for this endpoint
    config: ClusterConfig,

    /// Monotonic millisecond clock shared by probes and timestamps
    clock: Arc<MonotonicClock>,

    /// Map of all known members and their current state
    members: Membership,

    /// Outstanding probes awaiting an ACK
    pending_acks: PendingAckTable,

    /// Rolling RTT window driving the adaptive ack timeout
    ping_data: parking_lot::RwLock<PingData>,

    /// User broadcasts waiting for piggyback slots
    broadcasts: BroadcastBuffer,

    /// Communication layer for sending and receiving datagrams
    transport: Arc<dyn DatagramTransport>,

    /// Optional status-change callback
    event_handler: Option<Arc<dyn ClusterEventHandler>>,

    /// Current lifecycle state
    state: tokio::sync::RwLock<ClusterState>,

    /// Channel sender for initiating shutdown
    shutdown: broadcast::Sender<()>,

    /// Logical probe counter, loosely synchronized across the cluster
    current_heartbeat: AtomicU32,

    /// Checked by every long-running loop
    running: AtomicBool,

    /// Advertised identity; the port is fixed up after binding
    self_addr: parking_lot::RwLock<SocketAddrV4>,

    /// Receiving half of the transport channel, claimed by start()
    transport_channel: Mutex<Option<TransportChannel>>,

    /// Status transitions awaiting dispatch to the event handler
    status_events: Mutex<Option<mpsc::UnboundedReceiver<StatusChange>>>,
}

impl Clone for Cluster {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Cluster {
    /// Creates a new cluster endpoint without a status-change callback.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_event_handler(config, None)
    }

    /// Creates a new cluster endpoint with an optional status-change
    /// callback. Nothing touches the network until [`Cluster::start`].
    pub fn with_event_handler(
        config: ClusterConfig,
        event_handler: Option<Arc<dyn ClusterEventHandler>>,
    ) -> Result<Self> {
        let (transport, transport_channel) =
            UdpTransport::new(config.listen_ip(), config.listen_port());
        Self::with_transport(config, Arc::new(transport), transport_channel, event_handler)
    }

    pub(crate) fn with_transport(
        config: ClusterConfig,
        transport: Arc<dyn DatagramTransport>,
        transport_channel: TransportChannel,
        event_handler: Option<Arc<dyn ClusterEventHandler>>,
    ) -> Result<Self> {
        let clock = Arc::new(MonotonicClock::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let self_addr = SocketAddrV4::new(config.listen_ip(), config.listen_port());

        Ok(Self {
            inner: Arc::new(InnerCluster {
                members: Membership::new(Arc::clone(&clock), events_tx),
                clock,
                config,
                pending_acks: PendingAckTable::new(),
                ping_data: parking_lot::RwLock::new(PingData::new(
                    RTT_WINDOW_CAPACITY,
                    RTT_SEED_MILLIS,
                )),
                broadcasts: BroadcastBuffer::new(),
                transport,
                event_handler,
                state: tokio::sync::RwLock::new(ClusterState::Idle),
                shutdown: shutdown_tx,
                current_heartbeat: AtomicU32::new(0),
                running: AtomicBool::new(false),
                self_addr: parking_lot::RwLock::new(self_addr),
                transport_channel: Mutex::new(Some(transport_channel)),
                status_events: Mutex::new(Some(events_rx)),
            }),
        })
    }

    /// Binds the UDP socket and runs the protocol until shutdown. Blocking;
    /// spawn it if the caller has other work to do. Bind failures are fatal
    /// and returned to the caller.
    pub async fn start(&self) -> Result<()> {
        let shutdown_rx = self.inner.shutdown.subscribe();

        let transport_channel = self
            .inner
            .transport_channel
            .lock()
            .take()
            .ok_or_else(|| anyhow!("cluster already started"))?;
        let events_rx = self
            .inner
            .status_events
            .lock()
            .take()
            .ok_or_else(|| anyhow!("cluster already started"))?;

        self.inner.transport.bind_socket().await?;

        let self_addr = self.bootstrap();
        info!("[HEARSAY] My host address: {}", self_addr);

        self.set_state(ClusterState::Running).await;
        self.inner.running.store(true, Ordering::Relaxed);

        // Initial hosts: a bad entry is logged and skipped, never fatal.
        for host in self.inner.config.initial_hosts() {
            match parse_node_address(host, self_addr.port(), *self_addr.ip()).await {
                Ok(peer) => {
                    self.inner.members.add(Node::new(*peer.ip(), peer.port()));
                }
                Err(e) => error!("Could not create node {}: {}", host, e),
            }
        }

        let mut dispatcher = ClusterListener::new(
            self.clone(),
            transport_channel,
            self.inner.shutdown.subscribe(),
        );
        tokio::spawn(async move { dispatcher.run().await });

        let listener_handle = Self::spawn_socket_listener_with_retry(
            Arc::clone(&self.inner.transport),
            ListenerBackoff::new(),
            self.inner.shutdown.subscribe(),
        );
        let timeout_handle = self.spawn_timeout_checker(self.inner.shutdown.subscribe());
        let detector_handle = self.spawn_failure_detector(self.inner.shutdown.subscribe());
        self.spawn_event_dispatch(events_rx, self.inner.shutdown.subscribe());

        let shutdown_reason = self
            .handle_shutdown_signal(listener_handle, timeout_handle, detector_handle, shutdown_rx)
            .await?;

        if shutdown_reason != ShutdownReason::Termination {
            let _ = self.inner.shutdown.send(());
        }

        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.transport.unbind_socket();
        self.set_state(ClusterState::Stopped).await;

        info!("[HEARSAY] Gracefully shut down due to {:?}", shutdown_reason);
        Ok(())
    }

    async fn handle_shutdown_signal(
        &self,
        listener_handle: tokio::task::JoinHandle<Result<()>>,
        timeout_handle: tokio::task::JoinHandle<Result<()>>,
        detector_handle: tokio::task::JoinHandle<Result<()>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<ShutdownReason> {
        tokio::select! {
            _ = listener_handle => Ok(ShutdownReason::ListenerFailure),
            _ = timeout_handle => Ok(ShutdownReason::TimeoutCheckerFailure),
            _ = detector_handle => Ok(ShutdownReason::DetectorFailure),
            _ = shutdown_rx.recv() => {
                info!("[RECV] Initiating graceful shutdown..");
                Ok(ShutdownReason::Termination)
            }
        }
    }

    /// Pins down this endpoint's identity after binding and registers the
    /// self node as Alive. Remote claims that we are dead are ignored, so
    /// this status never changes locally.
    pub(crate) fn bootstrap(&self) -> SocketAddrV4 {
        let addr = SocketAddrV4::new(
            self.inner.transport.local_ip(),
            self.inner.transport.listen_port(),
        );
        *self.inner.self_addr.write() = addr;
        self.inner.members.merge(addr, NodeStatus::Alive, 0);
        addr
    }

    fn spawn_socket_listener_with_retry(
        transport: Arc<dyn DatagramTransport>,
        mut backoff: ListenerBackoff,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    listener_result = transport.socket_listener() => {
                        match listener_result {
                            Ok(_) => {
                                backoff.succeeded();
                            }
                            Err(e) => match backoff.next_delay() {
                                Some(delay) => {
                                    error!(
                                        "UDP listener error: {}. Consecutive failures: {}",
                                        e,
                                        backoff.failures()
                                    );
                                    warn!("UDP listener restarting in {:?}", delay);

                                    tokio::select! {
                                        _ = time::sleep(delay) => {}
                                        _ = shutdown_rx.recv() => {
                                            warn!("[RECV] Shutdown signal received during UDP listener restart delay");
                                            return Ok(());
                                        }
                                    }
                                }
                                None => {
                                    return Err(anyhow!(
                                        "UDP listener failed {} times consecutively: {}",
                                        backoff.failures(),
                                        e
                                    ));
                                }
                            },
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        warn!("[RECV] Shutdown signal received, stopping UDP listener");
                        return Ok(());
                    }
                }
            }
        })
    }

    /// The failure-detector loop. Walks a fresh random permutation of all
    /// known peers, pinging one per heartbeat; dead peers are re-probed on
    /// an exponential backoff and eventually evicted. Registry inserts and
    /// removals restart the round so the permutation stays fresh.
    fn spawn_failure_detector(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let cluster = self.clone();

        tokio::spawn(async move {
            debug!("> starting failure detector.....");
            let heartbeat = cluster.inner.config.heartbeat_interval();

            'rounds: loop {
                if !cluster.inner.running.load(Ordering::Relaxed) {
                    break;
                }

                let self_addr = cluster.self_addr();
                let round = cluster.inner.members.get_random_nodes(0, &[self_addr]);
                let mut ping_counter = 0u32;

                for node in &round {
                    if !cluster.inner.running.load(Ordering::Relaxed) {
                        break 'rounds;
                    }

                    if node.status() == NodeStatus::Dead {
                        match cluster.inner.members.dead_node_tick(node.address()) {
                            DeadNodeDecision::Skip => continue,
                            DeadNodeDecision::Evict => {
                                cluster.inner.members.remove(node.address());
                                continue;
                            }
                            DeadNodeDecision::Probe => {}
                        }
                    }

                    let code = cluster
                        .inner
                        .current_heartbeat
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;

                    debug!(
                        "{} - hosts={} (announce={} forward={})",
                        code,
                        round.len(),
                        cluster.inner.members.emit_count(),
                        cluster.inner.members.ping_request_count()
                    );

                    if let Err(e) = cluster.transmit_ping(node.address(), code).await {
                        info!("Failure to ping {} -> {}", node.address(), e);
                    }
                    ping_counter += 1;

                    tokio::select! {
                        _ = time::sleep(heartbeat) => {}
                        _ = shutdown_rx.recv() => {
                            info!("[RECV] Failure detector shutting down");
                            return Ok(());
                        }
                    }

                    if cluster.inner.members.take_modified() {
                        continue 'rounds;
                    }
                }

                if ping_counter == 0 {
                    debug!("No nodes to ping. So lonely. :(");
                    tokio::select! {
                        _ = time::sleep(heartbeat) => {}
                        _ = shutdown_rx.recv() => {
                            info!("[RECV] Failure detector shutting down");
                            return Ok(());
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Sweeps the pending-ack table every 100 ms, comparing each entry's age
    /// against the adaptive deadline and taking the per-kind timeout action.
    fn spawn_timeout_checker(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let cluster = self.clone();

        tokio::spawn(async move {
            let mut sweep =
                time::interval(std::time::Duration::from_millis(TIMEOUT_SWEEP_MILLIS));
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        cluster.check_pending_timeouts();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("[RECV] Timeout checker shutting down");
                        break;
                    }
                }
            }
            Ok(())
        })
    }

    fn spawn_event_dispatch(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<StatusChange>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let cluster = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        match event {
                            Some(change) => {
                                if let Some(handler) = &cluster.inner.event_handler {
                                    if let Err(e) = handler
                                        .on_status_change(&change.node, change.new_status)
                                        .await
                                    {
                                        warn!(
                                            "Status-change handler failed for {}: {}",
                                            change.node, e
                                        );
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn check_pending_timeouts(&self) {
        let base_timeout = self
            .inner
            .ping_data
            .read()
            .timeout_millis(TIMEOUT_TOLERANCE_SIGMAS);
        let now = self.inner.clock.now_millis();

        for (key, pack) in self.inner.pending_acks.take_expired(now, base_timeout) {
            match pack.kind {
                ProbeKind::Ping => {
                    let cluster = self.clone();
                    tokio::spawn(async move {
                        cluster.forward_on_timeout(pack).await;
                    });
                }
                ProbeKind::PingReq => {
                    debug!(
                        "{} timed out after {} ms (dropped PINGREQ)",
                        key,
                        base_timeout * 2
                    );
                    // For a PINGREQ entry the callback is the suspected
                    // peer; the relay answered for nobody.
                    if let Some(suspect) = pack.callback {
                        if self.inner.members.contains(suspect) {
                            self.mark_peer_dead(suspect);
                        }
                    }
                }
                ProbeKind::Nfp => {
                    debug!("{} timed out after {} ms (dropped NFP)", key, base_timeout);
                    if self.inner.members.contains(pack.target) {
                        self.mark_peer_dead(pack.target);
                    }
                }
            }
        }
    }

    fn mark_peer_dead(&self, addr: SocketAddrV4) {
        let heartbeat = self.inner.current_heartbeat.load(Ordering::Relaxed);
        self.inner.members.merge(addr, NodeStatus::Dead, heartbeat);
        self.inner
            .members
            .record_ping_millis(addr, PingDuration::TimedOut);
    }

    /// A direct probe missed its deadline: ask a handful of random live
    /// peers to probe the suspect on our behalf. With nobody left to ask,
    /// the suspect is declared dead outright.
    async fn forward_on_timeout(&self, pack: PendingAck) {
        let self_addr = self.self_addr();
        let count = self.inner.members.ping_request_count();
        let relays = self
            .inner
            .members
            .get_target_nodes(count, &[self_addr, pack.target]);

        if relays.is_empty() {
            debug!("{} cannot forward ping request: no more nodes", self_addr);
            self.mark_peer_dead(pack.target);
            return;
        }

        let code = self.inner.current_heartbeat.load(Ordering::Relaxed);
        for (i, relay) in relays.iter().enumerate() {
            debug!(
                "({}/{}) Requesting indirect ping of {} via {}",
                i + 1,
                relays.len(),
                pack.target,
                relay.address()
            );

            if let Err(e) = self
                .transmit_ping_request(relay.address(), pack.target, code)
                .await
            {
                warn!(
                    "Failed to send indirect ping to {} for target {}: {}",
                    relay.address(),
                    pack.target,
                    e
                );
            }
        }
    }

    //+=========================+
    //| TRANSMIT PATHS
    //+=========================+

    async fn transmit_ping(&self, target: SocketAddrV4, code: u32) -> Result<()> {
        self.inner.pending_acks.insert(
            AckKey {
                addr: target,
                heartbeat: code,
            },
            PendingAck {
                target,
                start_time_ms: self.inner.clock.now_millis(),
                callback: None,
                callback_code: 0,
                kind: ProbeKind::Ping,
            },
        );
        self.transmit_generic(target, None, Verb::Ping, code).await
    }

    async fn transmit_ping_request(
        &self,
        relay: SocketAddrV4,
        target: SocketAddrV4,
        code: u32,
    ) -> Result<()> {
        self.inner.pending_acks.insert(
            AckKey {
                addr: relay,
                heartbeat: code,
            },
            PendingAck {
                target: relay,
                start_time_ms: self.inner.clock.now_millis(),
                callback: Some(target),
                callback_code: 0,
                kind: ProbeKind::PingReq,
            },
        );
        self.transmit_generic(relay, Some(target), Verb::PingRequest, code)
            .await
    }

    async fn transmit_nfp(
        &self,
        target: SocketAddrV4,
        requester: SocketAddrV4,
        code: u32,
    ) -> Result<()> {
        self.inner.pending_acks.insert(
            AckKey {
                addr: target,
                heartbeat: code,
            },
            PendingAck {
                target,
                start_time_ms: self.inner.clock.now_millis(),
                callback: Some(requester),
                callback_code: code,
                kind: ProbeKind::Nfp,
            },
        );
        self.transmit_generic(target, None, Verb::NonForwardingPing, code)
            .await
    }

    async fn transmit_ack(&self, target: SocketAddrV4, code: u32) -> Result<()> {
        self.transmit_generic(target, None, Verb::Ack, code).await
    }

    /// Builds and sends one datagram: the verb, an optional FORWARD_TO
    /// marker, piggybacked member records (freshest news first, falling back
    /// to random peers when there is none), and at most one broadcast.
    async fn transmit_generic(
        &self,
        dest: SocketAddrV4,
        forward_to: Option<SocketAddrV4>,
        verb: Verb,
        code: u32,
    ) -> Result<()> {
        let sender = self.self_addr();
        let mut msg = Message::new(verb, sender, code);

        if let Some(target) = forward_to {
            msg.add_member(MemberRecord::forward_to(target, code))?;
        }

        let budget = crate::config::MAX_PIGGYBACK_MEMBERS.saturating_sub(msg.members.len());
        let fanout = self.inner.members.ping_request_count().min(budget);

        let mut picks = self
            .inner
            .members
            .get_random_updated_nodes(fanout, &[dest, sender]);
        if picks.is_empty() {
            picks = self.inner.members.get_random_nodes(fanout, &[dest, sender]);
        }

        for node in &picks {
            msg.add_member(MemberRecord::from_node(node))?;
            self.inner.members.decrement_emit(node.address());
        }

        if let Some(frame) = self.inner.broadcasts.next_to_emit() {
            msg.add_broadcast(frame);
        }

        let mut buf = BytesMut::new();
        MessageCodec::new().encode(msg, &mut buf)?;
        self.inner.transport.send_datagram(dest, &buf).await?;

        trace!("Sent {} to {}", verb, dest);
        Ok(())
    }

    //+=========================+
    //| RECEIVE PATHS
    //+=========================+

    /// Handles one inbound datagram. Handler order matters: heartbeat sync,
    /// member-status merge, broadcast intake, then the verb itself.
    pub(crate) async fn handle_datagram(&self, src: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        let source_ip = match src {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => {
                return Err(anyhow!("dropping datagram from non-IPv4 source {}", src))
            }
        };

        let mut buf = BytesMut::from(&bytes[..]);
        let msg = MessageCodec::with_source_ip(source_ip)
            .decode(&mut buf)?
            .ok_or_else(|| anyhow!("empty datagram from {}", src))?;

        trace!(
            "Got {} from {} code={}",
            msg.verb,
            msg.sender,
            msg.sender_heartbeat
        );

        // Keep heartbeat counters loosely synchronized without a
        // coordinator.
        let current = self.inner.current_heartbeat.load(Ordering::Relaxed);
        if msg.sender_heartbeat > 0 && msg.sender_heartbeat - 1 > current {
            trace!(
                "Heartbeat advanced from {} to {}",
                current,
                msg.sender_heartbeat - 1
            );
            self.inner
                .current_heartbeat
                .store(msg.sender_heartbeat - 1, Ordering::Relaxed);
        }

        self.update_statuses_from_message(&msg);

        if let Some(frame) = msg.broadcast.clone() {
            self.receive_broadcast(frame);
        }

        match msg.verb {
            Verb::Ping => self.receive_ping(&msg).await,
            Verb::Ack => self.receive_ack(&msg).await,
            Verb::PingRequest => self.receive_ping_request(&msg).await,
            Verb::NonForwardingPing => self.receive_non_forwarding_ping(&msg).await,
        }
    }

    /// Merges piggybacked member records into the registry (see the drop
    /// rules below), then credits the sender itself as alive.
    fn update_statuses_from_message(&self, msg: &Message) {
        let self_addr = self.self_addr();

        for member in &msg.members {
            let status = match member.status.to_node_status() {
                Some(status) => status,
                // FORWARD_TO routes a PINGREQ; it is not peer state.
                None => continue,
            };

            if let Some(known) = self.inner.members.get(member.address()) {
                if member.heartbeat < known.heartbeat() {
                    warn!(
                        "Message about {} is old ({} vs {}): dropping",
                        member.address(),
                        known.heartbeat(),
                        member.heartbeat
                    );
                    continue;
                }
            }

            // Don't tell ME I'm dead. Continued presence is the rebuttal.
            if status == NodeStatus::Dead && member.address() == self_addr {
                continue;
            }

            self.inner
                .members
                .merge(member.address(), status, member.heartbeat);
        }

        let sender_known_heartbeat = self
            .inner
            .members
            .get(msg.sender)
            .map(|n| n.heartbeat())
            .unwrap_or(0);
        if msg.sender_heartbeat > sender_known_heartbeat {
            self.inner
                .members
                .merge(msg.sender, NodeStatus::Alive, msg.sender_heartbeat);
        }
        if !self.inner.members.contains(msg.sender) {
            self.inner
                .members
                .add(Node::new(*msg.sender.ip(), msg.sender.port()));
        }
    }

    async fn receive_ping(&self, msg: &Message) -> Result<()> {
        self.transmit_ack(msg.sender, msg.sender_heartbeat).await
    }

    /// An NFP is answered exactly like a PING, but is never forwarded
    /// further: that is the whole point of the verb.
    async fn receive_non_forwarding_ping(&self, msg: &Message) -> Result<()> {
        self.transmit_ack(msg.sender, msg.sender_heartbeat).await
    }

    async fn receive_ack(&self, msg: &Message) -> Result<()> {
        let key = AckKey {
            addr: msg.sender,
            heartbeat: msg.sender_heartbeat,
        };

        if let Some(pack) = self.inner.pending_acks.take(&key) {
            self.inner.members.touch(msg.sender);

            if let Some(callback) = pack.callback {
                // A response to a requested ping: pass the good news along.
                let cluster = self.clone();
                let code = pack.callback_code;
                tokio::spawn(async move {
                    if let Err(e) = cluster.transmit_ack(callback, code).await {
                        warn!("Failed to relay ack to {}: {}", callback, e);
                    }
                });
            } else {
                self.note_ping_response_time(&pack);
            }
        }

        Ok(())
    }

    fn note_ping_response_time(&self, pack: &PendingAck) {
        let elapsed = pack.elapsed(self.inner.clock.now_millis());
        self.inner
            .members
            .record_ping_millis(pack.target, PingDuration::Millis(elapsed));

        let mut ping_data = self.inner.ping_data.write();
        ping_data.add(elapsed);
        trace!(
            "Got ACK in {}ms (mean={:.02} stddev={:.02} sigmas={:.02})",
            elapsed,
            ping_data.mean(),
            ping_data.stddev(),
            ping_data.n_sigma(TIMEOUT_TOLERANCE_SIGMAS)
        );
    }

    /// Fulfils an indirect-probe request: remember who asked, then send a
    /// non-forwarding ping to the named target. Requests that fail to name a
    /// target are ignored.
    async fn receive_ping_request(&self, msg: &Message) -> Result<()> {
        if let Some(member) = msg.members.first() {
            if member.status == WireStatus::ForwardTo {
                let target = member.address();
                let code = member.heartbeat;
                return self.transmit_nfp(target, msg.sender, code).await;
            }
        }
        Ok(())
    }

    fn receive_broadcast(&self, frame: BroadcastFrame) {
        let emit = (self.inner.members.emit_count() as i16).max(1);
        self.inner.broadcasts.receive(frame, emit);
    }

    //+=========================+
    //| PUBLIC API
    //+=========================+

    fn self_addr(&self) -> SocketAddrV4 {
        *self.inner.self_addr.read()
    }

    /// This endpoint's own registry entry. Available once started.
    pub fn local_node(&self) -> Result<Node> {
        self.inner
            .members
            .get(self.self_addr())
            .ok_or_else(|| anyhow!("local node is not set"))
    }

    /// Every node known right now, dead ones included.
    pub fn all_nodes(&self) -> Vec<Node> {
        self.inner.members.values()
    }

    /// Every node currently believed alive.
    pub fn healthy_nodes(&self) -> Vec<Node> {
        self.inner
            .members
            .values()
            .into_iter()
            .filter(|n| n.is_alive())
            .collect()
    }

    /// Explicitly adds a peer to the registry. Returns the canonical node;
    /// adding a known address is a no-op.
    pub fn add_node(&self, node: Node) -> Node {
        self.inner.members.add(node).1
    }

    /// Explicitly probes a node right now, outside the detector's cadence.
    pub async fn ping_node(&self, node: &Node) -> Result<()> {
        let code = self.inner.current_heartbeat.load(Ordering::Relaxed);
        let result = self.transmit_ping(node.address(), code).await;
        if let Err(e) = &result {
            info!("Failure to ping {} -> {}", node, e);
        }
        result
    }

    /// Queues an opaque payload for gossip to the rest of the group. It
    /// rides the same piggyback slots as membership news and ages out after
    /// a bounded number of emissions.
    pub fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        let emit = (self.inner.members.emit_count() as i16).max(1);
        self.inner
            .broadcasts
            .queue_local(self.self_addr(), payload, emit)
    }

    /// Registers the receiving end for broadcasts originated elsewhere in
    /// the cluster. Each unique broadcast is delivered at most once; when
    /// the buffer is full, deliveries are dropped rather than allowed to
    /// stall packet handling.
    pub fn with_receiver(&self, buffer: usize) -> mpsc::Receiver<ReceivedBroadcast> {
        self.inner.broadcasts.subscribe(buffer)
    }

    /// Requests shutdown: every loop observes the flag and exits at its next
    /// suspension point; in-flight handlers finish naturally.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        match *state {
            ClusterState::Running => {
                self.inner.running.store(false, Ordering::Relaxed);
                self.inner
                    .shutdown
                    .send(())
                    .map_err(|e| anyhow!(e.to_string()))?;
                *state = ClusterState::Stopped;
                Ok(())
            }
            ClusterState::Idle => Err(anyhow!("cluster is not running")),
            ClusterState::Stopped => Ok(()), // Already stopped, no-op
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.state.read().await, ClusterState::Running)
    }

    async fn set_state(&self, cluster_state: ClusterState) {
        let mut state = self.inner.state.write().await;
        *state = cluster_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn peer(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn mock_cluster(port: u16) -> (Cluster, Arc<MockTransport>) {
        let config = ClusterConfigBuilder::new()
            .addr(Ipv4Addr::LOCALHOST)
            .port(port)
            .heartbeat_millis(100)
            .build()
            .unwrap();

        let (transport, channel) = MockTransport::new(Ipv4Addr::LOCALHOST, port);
        let transport = Arc::new(transport);
        let cluster =
            Cluster::with_transport(config, transport.clone(), channel, None).unwrap();
        cluster.bootstrap();
        (cluster, transport)
    }

    fn encode(msg: Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        MessageCodec::new().encode(msg, &mut buf).unwrap();
        buf.to_vec()
    }

    fn decode(bytes: &[u8]) -> Message {
        let mut buf = BytesMut::from(bytes);
        MessageCodec::new().decode(&mut buf).unwrap().unwrap()
    }

    async fn inject(cluster: &Cluster, from: SocketAddrV4, msg: Message) {
        cluster
            .handle_datagram(SocketAddr::V4(from), encode(msg))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_ack() {
        let (cluster, transport) = mock_cluster(9999);
        let from = peer(8001);

        inject(&cluster, from, Message::new(Verb::Ping, from, 5)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, from);

        let reply = decode(&sent[0].1);
        assert_eq!(reply.verb, Verb::Ack);
        assert_eq!(reply.sender_heartbeat, 5);
    }

    #[tokio::test]
    async fn test_unknown_sender_is_learned_alive() {
        let (cluster, _transport) = mock_cluster(9999);
        let from = peer(8001);

        inject(&cluster, from, Message::new(Verb::Ping, from, 5)).await;

        let node = cluster.inner.members.get(from).unwrap();
        assert_eq!(node.status(), NodeStatus::Alive);
        assert_eq!(node.heartbeat(), 5);
    }

    #[tokio::test]
    async fn test_nfp_is_answered_but_never_forwarded() {
        let (cluster, transport) = mock_cluster(9999);
        let from = peer(8001);

        inject(
            &cluster,
            from,
            Message::new(Verb::NonForwardingPing, from, 8),
        )
        .await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(decode(&sent[0].1).verb, Verb::Ack);
        assert_eq!(cluster.inner.pending_acks.len(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_counters_synchronize() {
        let (cluster, _transport) = mock_cluster(9999);
        cluster.inner.current_heartbeat.store(42, Ordering::Relaxed);

        let from = peer(8001);
        inject(&cluster, from, Message::new(Verb::Ping, from, 1_000_000)).await;

        assert!(cluster.inner.current_heartbeat.load(Ordering::Relaxed) >= 999_999);
    }

    #[tokio::test]
    async fn test_zero_sender_heartbeat_does_not_advance() {
        let (cluster, _transport) = mock_cluster(9999);

        let from = peer(8001);
        inject(&cluster, from, Message::new(Verb::Ping, from, 0)).await;

        assert_eq!(cluster.inner.current_heartbeat.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_stale_member_update_is_dropped() {
        let (cluster, _transport) = mock_cluster(9999);
        let subject = peer(8002);
        cluster.inner.members.merge(subject, NodeStatus::Alive, 100);

        let from = peer(8001);
        let mut msg = Message::new(Verb::Ping, from, 3);
        msg.add_member(MemberRecord {
            ip: *subject.ip(),
            port: subject.port(),
            status: WireStatus::Dead,
            heartbeat: 50,
        })
        .unwrap();
        inject(&cluster, from, msg).await;

        let node = cluster.inner.members.get(subject).unwrap();
        assert_eq!(node.status(), NodeStatus::Alive);
        assert_eq!(node.heartbeat(), 100);
    }

    #[tokio::test]
    async fn test_remote_claim_of_own_death_is_ignored() {
        let (cluster, _transport) = mock_cluster(9999);
        let self_addr = cluster.self_addr();

        // Quiesce the bootstrap event so only new notifications are seen.
        let mut events = cluster.inner.status_events.lock().take().unwrap();
        while events.try_recv().is_ok() {}

        let from = peer(8001);
        let mut msg = Message::new(Verb::Ping, from, 3);
        msg.add_member(MemberRecord {
            ip: *self_addr.ip(),
            port: self_addr.port(),
            status: WireStatus::Dead,
            heartbeat: 999,
        })
        .unwrap();
        inject(&cluster, from, msg).await;

        let me = cluster.inner.members.get(self_addr).unwrap();
        assert_eq!(me.status(), NodeStatus::Alive);

        // No notification fired for the self node.
        while let Ok(change) = events.try_recv() {
            assert_ne!(change.node.address(), self_addr);
        }
    }

    #[tokio::test]
    async fn test_ping_request_relays_an_nfp() {
        let (cluster, transport) = mock_cluster(9999);
        let requester = peer(8001);
        let target = peer(8002);

        let mut msg = Message::new(Verb::PingRequest, requester, 9);
        msg.add_member(MemberRecord::forward_to(target, 9)).unwrap();
        inject(&cluster, requester, msg).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, target);
        let nfp = decode(&sent[0].1);
        assert_eq!(nfp.verb, Verb::NonForwardingPing);
        assert_eq!(nfp.sender_heartbeat, 9);

        let pack = cluster
            .inner
            .pending_acks
            .take(&AckKey {
                addr: target,
                heartbeat: 9,
            })
            .unwrap();
        assert_eq!(pack.kind, ProbeKind::Nfp);
        assert_eq!(pack.callback, Some(requester));
        assert_eq!(pack.callback_code, 9);
    }

    #[tokio::test]
    async fn test_ping_request_without_target_is_ignored() {
        let (cluster, transport) = mock_cluster(9999);
        let requester = peer(8001);

        inject(
            &cluster,
            requester,
            Message::new(Verb::PingRequest, requester, 9),
        )
        .await;

        assert!(transport.sent().is_empty());
        assert_eq!(cluster.inner.pending_acks.len(), 0);
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_probe_and_records_rtt() {
        let (cluster, transport) = mock_cluster(9999);
        let subject = peer(8001);
        cluster.inner.members.merge(subject, NodeStatus::Alive, 1);
        transport.clear();

        cluster.transmit_ping(subject, 7).await.unwrap();
        assert_eq!(cluster.inner.pending_acks.len(), 1);

        inject(&cluster, subject, Message::new(Verb::Ack, subject, 7)).await;

        assert_eq!(cluster.inner.pending_acks.len(), 0);
        let node = cluster.inner.members.get(subject).unwrap();
        assert!(matches!(node.ping_millis(), PingDuration::Millis(_)));
    }

    #[tokio::test]
    async fn test_late_ack_for_resolved_probe_is_ignored() {
        let (cluster, transport) = mock_cluster(9999);
        let subject = peer(8001);
        cluster.inner.members.merge(subject, NodeStatus::Alive, 1);
        transport.clear();

        inject(&cluster, subject, Message::new(Verb::Ack, subject, 99)).await;

        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_relay_ack_travels_back_to_requester() {
        let (cluster, transport) = mock_cluster(9999);
        let requester = peer(8001);
        let target = peer(8002);

        let mut msg = Message::new(Verb::PingRequest, requester, 4);
        msg.add_member(MemberRecord::forward_to(target, 4)).unwrap();
        inject(&cluster, requester, msg).await;
        transport.clear();

        inject(&cluster, target, Message::new(Verb::Ack, target, 4)).await;

        // The relay happens on a spawned sender task.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, requester);
        let relayed = decode(&sent[0].1);
        assert_eq!(relayed.verb, Verb::Ack);
        assert_eq!(relayed.sender_heartbeat, 4);
    }

    #[tokio::test]
    async fn test_outbound_members_exclude_destination_and_self() {
        let (cluster, transport) = mock_cluster(9999);
        let self_addr = cluster.self_addr();
        for i in 1..=5u16 {
            cluster
                .inner
                .members
                .merge(peer(8000 + i), NodeStatus::Alive, 1);
        }
        transport.clear();

        let dest = peer(8001);
        cluster.transmit_ping(dest, 2).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let msg = decode(&sent[0].1);
        let fanout = cluster.inner.members.ping_request_count();

        assert!(msg.members.len() <= fanout);
        for member in &msg.members {
            assert_ne!(member.address(), dest);
            assert_ne!(member.address(), self_addr);
        }
    }

    #[tokio::test]
    async fn test_no_piggybacked_members_when_alone() {
        let (cluster, transport) = mock_cluster(9999);
        transport.clear();

        cluster.transmit_ping(peer(8001), 1).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(decode(&sent[0].1).members.is_empty());
    }

    #[tokio::test]
    async fn test_piggybacked_emission_decrements_counter() {
        let (cluster, transport) = mock_cluster(9999);
        for i in 1..=4u16 {
            cluster
                .inner
                .members
                .merge(peer(8000 + i), NodeStatus::Alive, 1);
        }
        let subject = peer(8001);
        cluster.inner.members.merge(subject, NodeStatus::Dead, 5);
        let armed = cluster.inner.members.get(subject).unwrap().emit_counter;
        assert!(armed > 0);
        transport.clear();

        cluster.transmit_ping(peer(8002), 6).await.unwrap();

        let msg = decode(&transport.sent()[0].1);
        let carried = msg
            .members
            .iter()
            .any(|m| m.address() == subject && m.status == WireStatus::Dead);
        assert!(carried, "freshest news should ride first");

        let after = cluster.inner.members.get(subject).unwrap().emit_counter;
        assert_eq!(after, armed - 1);
    }

    #[tokio::test]
    async fn test_local_broadcast_rides_outbound_datagrams() {
        let (cluster, transport) = mock_cluster(9999);
        for i in 1..=3u16 {
            cluster
                .inner
                .members
                .merge(peer(8000 + i), NodeStatus::Alive, 1);
        }
        cluster.broadcast(b"rollout complete".to_vec()).unwrap();
        transport.clear();

        cluster.transmit_ping(peer(8001), 2).await.unwrap();

        let msg = decode(&transport.sent()[0].1);
        let frame = msg.broadcast.expect("broadcast should be attached");
        assert_eq!(frame.payload, b"rollout complete".to_vec());
        assert_eq!(frame.origin, cluster.self_addr());
    }

    #[tokio::test]
    async fn test_received_broadcast_is_delivered_exactly_once() {
        let (cluster, _transport) = mock_cluster(9999);
        let mut receiver = cluster.with_receiver(4);
        let from = peer(8001);

        let mut msg = Message::new(Verb::Ping, from, 2);
        msg.add_broadcast(BroadcastFrame {
            origin: from,
            index: 0,
            payload: b"all hands".to_vec(),
        });
        inject(&cluster, from, msg.clone()).await;
        inject(&cluster, from, msg).await;

        let delivered = receiver.try_recv().unwrap();
        assert_eq!(delivered.origin, from);
        assert_eq!(delivered.payload, b"all hands".to_vec());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_timeout_fans_out_ping_requests() {
        let (cluster, transport) = mock_cluster(9999);
        let suspect = peer(8001);
        let relay_a = peer(8002);
        let relay_b = peer(8003);
        for addr in [suspect, relay_a, relay_b] {
            cluster.inner.members.merge(addr, NodeStatus::Alive, 1);
        }

        cluster.transmit_ping(suspect, 3).await.unwrap();
        transport.clear();

        // Let the probe age past the seeded 50 ms deadline, then sweep.
        tokio::time::sleep(Duration::from_millis(80)).await;
        cluster.check_pending_timeouts();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        for (dest, bytes) in &sent {
            assert!(*dest == relay_a || *dest == relay_b);
            let msg = decode(bytes);
            assert_eq!(msg.verb, Verb::PingRequest);
            assert_eq!(msg.members[0].status, WireStatus::ForwardTo);
            assert_eq!(msg.members[0].address(), suspect);
        }

        // The suspect is not yet dead; the indirect path may still succeed.
        assert_eq!(
            cluster.inner.members.get(suspect).unwrap().status(),
            NodeStatus::Alive
        );
    }

    #[tokio::test]
    async fn test_ping_timeout_with_no_relays_marks_suspect_dead() {
        let (cluster, transport) = mock_cluster(9999);
        let suspect = peer(8001);
        cluster.inner.members.merge(suspect, NodeStatus::Alive, 1);

        cluster.transmit_ping(suspect, 3).await.unwrap();
        transport.clear();

        tokio::time::sleep(Duration::from_millis(80)).await;
        cluster.check_pending_timeouts();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let node = cluster.inner.members.get(suspect).unwrap();
        assert_eq!(node.status(), NodeStatus::Dead);
        assert_eq!(node.ping_millis(), PingDuration::TimedOut);
    }

    #[tokio::test]
    async fn test_ping_request_timeout_marks_suspect_dead() {
        let (cluster, _transport) = mock_cluster(9999);
        let relay = peer(8002);
        let suspect = peer(8001);
        cluster.inner.members.merge(suspect, NodeStatus::Alive, 1);
        cluster.inner.members.merge(relay, NodeStatus::Alive, 1);

        cluster.inner.pending_acks.insert(
            AckKey {
                addr: relay,
                heartbeat: 5,
            },
            PendingAck {
                target: relay,
                start_time_ms: cluster.inner.clock.now_millis(),
                callback: Some(suspect),
                callback_code: 0,
                kind: ProbeKind::PingReq,
            },
        );

        // PINGREQs run on a doubled deadline: 2 x 50 ms seeded timeout.
        tokio::time::sleep(Duration::from_millis(150)).await;
        cluster.check_pending_timeouts();

        let node = cluster.inner.members.get(suspect).unwrap();
        assert_eq!(node.status(), NodeStatus::Dead);
        assert_eq!(node.ping_millis(), PingDuration::TimedOut);

        // The relay answered for nobody but is not itself suspected.
        assert_eq!(
            cluster.inner.members.get(relay).unwrap().status(),
            NodeStatus::Alive
        );
    }

    #[tokio::test]
    async fn test_nfp_timeout_marks_target_dead() {
        let (cluster, _transport) = mock_cluster(9999);
        let requester = peer(8001);
        let target = peer(8002);
        cluster.inner.members.merge(target, NodeStatus::Alive, 1);

        cluster.inner.pending_acks.insert(
            AckKey {
                addr: target,
                heartbeat: 5,
            },
            PendingAck {
                target,
                start_time_ms: cluster.inner.clock.now_millis(),
                callback: Some(requester),
                callback_code: 5,
                kind: ProbeKind::Nfp,
            },
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        cluster.check_pending_timeouts();

        let node = cluster.inner.members.get(target).unwrap();
        assert_eq!(node.status(), NodeStatus::Dead);
        assert_eq!(node.ping_millis(), PingDuration::TimedOut);
    }
}
