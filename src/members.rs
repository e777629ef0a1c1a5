use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::mpsc;

use crate::clock::MonotonicClock;
use crate::config::{LAMBDA, MAX_DEAD_NODE_RETRIES};
use crate::node::{Node, PingDuration};
use crate::state::NodeStatus;

/// Emitted on every effective status transition, drained by the cluster's
/// event dispatch task.
#[derive(Debug, Clone)]
pub(crate) struct StatusChange {
    pub(crate) node: Node,
    pub(crate) new_status: NodeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeAction {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug)]
pub(crate) struct MergeResult {
    pub(crate) action: MergeAction,
    pub(crate) old_status: Option<NodeStatus>,
    pub(crate) new_status: NodeStatus,
}

/// What the failure detector should do with a Dead node this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeadNodeDecision {
    Skip,
    Probe,
    Evict,
}

#[derive(Debug)]
struct DeadNodeCounter {
    retry: u32,
    countdown: i32,
}

fn lambda_count(cluster_size: usize) -> usize {
    if cluster_size == 0 {
        return 0;
    }
    let mult = LAMBDA * (cluster_size as f64).ln() + 0.5;
    mult.max(0.0).floor() as usize
}

/// The concurrent membership registry: all known peers living and dead, the
/// recently-updated set driving dissemination, and the dead-node retry
/// counters. Lock order is nodes, then updated, then dead_retries.
pub(crate) struct Membership {
    nodes: RwLock<HashMap<SocketAddrV4, Node>>,
    updated: RwLock<HashSet<SocketAddrV4>>,
    dead_retries: Mutex<HashMap<SocketAddrV4, DeadNodeCounter>>,

    /// Set on insert/remove; the failure detector swaps it off and restarts
    /// its round with a fresh permutation.
    modified: AtomicBool,

    clock: Arc<MonotonicClock>,
    events: mpsc::UnboundedSender<StatusChange>,
}

impl Membership {
    pub(crate) fn new(
        clock: Arc<MonotonicClock>,
        events: mpsc::UnboundedSender<StatusChange>,
    ) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            updated: RwLock::new(HashSet::new()),
            dead_retries: Mutex::new(HashMap::new()),
            modified: AtomicBool::new(false),
            clock,
            events,
        }
    }

    /// Explicitly adds a node. A node arriving without a status is promoted
    /// to Alive through the regular transition path. Returns whether an
    /// insert happened and the canonical node.
    pub(crate) fn add(&self, mut node: Node) -> (bool, Node) {
        let addr = node.address();
        let now = self.clock.now_millis();

        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&addr) {
            return (false, existing.clone());
        }

        let mut changed = false;
        if node.status == NodeStatus::Unknown {
            warn!("{} does not have a status! Setting to {}", node, NodeStatus::Alive);
            let heartbeat = node.heartbeat;
            let emit = lambda_count(nodes.len());
            changed = Self::apply_status(&mut node, NodeStatus::Alive, heartbeat, emit, now);
        }
        node.timestamp_ms = now;

        nodes.insert(addr, node.clone());
        let (total, live, dead) = Self::tally(&nodes);
        drop(nodes);

        if changed {
            self.updated.write().insert(addr);
            let _ = self.events.send(StatusChange {
                node: node.clone(),
                new_status: node.status,
            });
        }

        self.modified.store(true, Ordering::Relaxed);
        info!(
            "Adding host: {} (total={} live={} dead={})",
            addr, total, live, dead
        );

        (true, node)
    }

    /// Removes a node from the registry. Its dead-retry entry, if any, is
    /// dropped along with it.
    pub(crate) fn remove(&self, addr: SocketAddrV4) -> Option<Node> {
        let mut nodes = self.nodes.write();
        let mut node = nodes.remove(&addr)?;
        node.timestamp_ms = self.clock.now_millis();
        let (total, live, dead) = Self::tally(&nodes);
        drop(nodes);

        self.updated.write().remove(&addr);
        self.dead_retries.lock().remove(&addr);

        self.modified.store(true, Ordering::Relaxed);
        info!(
            "Removing host: {} (total={} live={} dead={})",
            addr, total, live, dead
        );

        Some(node)
    }

    /// The single mutation entry point: applies a status observed with the
    /// given heartbeat, inserting the peer if it is unknown. No-op updates
    /// change nothing and notify nobody.
    pub(crate) fn merge(
        &self,
        addr: SocketAddrV4,
        status: NodeStatus,
        heartbeat: u32,
    ) -> MergeResult {
        let now = self.clock.now_millis();
        let mut nodes = self.nodes.write();
        let emit = lambda_count(nodes.len());

        if let Some(node) = nodes.get_mut(&addr) {
            let old_status = node.status;
            if !Self::apply_status(node, status, heartbeat, emit, now) {
                return MergeResult {
                    action: MergeAction::Unchanged,
                    old_status: Some(old_status),
                    new_status: old_status,
                };
            }
            let snapshot = node.clone();
            let (total, live, dead) = Self::tally(&nodes);
            drop(nodes);

            self.updated.write().insert(addr);
            if status != NodeStatus::Dead {
                self.dead_retries.lock().remove(&addr);
            }

            info!(
                "Updating host: {} to {} (total={} live={} dead={})",
                addr, status, total, live, dead
            );
            let _ = self.events.send(StatusChange {
                node: snapshot,
                new_status: status,
            });

            MergeResult {
                action: MergeAction::Updated,
                old_status: Some(old_status),
                new_status: status,
            }
        } else {
            let mut node = Node::new(*addr.ip(), addr.port());
            let changed = Self::apply_status(&mut node, status, heartbeat, emit, now);
            node.timestamp_ms = now;
            nodes.insert(addr, node.clone());
            let (total, live, dead) = Self::tally(&nodes);
            drop(nodes);

            if changed {
                self.updated.write().insert(addr);
                let _ = self.events.send(StatusChange {
                    node: node.clone(),
                    new_status: status,
                });
            }

            self.modified.store(true, Ordering::Relaxed);
            info!(
                "Adding host: {} as {} (total={} live={} dead={})",
                addr, status, total, live, dead
            );

            MergeResult {
                action: MergeAction::Added,
                old_status: None,
                new_status: status,
            }
        }
    }

    /// Mutates `node` in place for a status transition. Returns false when
    /// the status is unchanged, in which case nothing else is touched.
    fn apply_status(
        node: &mut Node,
        status: NodeStatus,
        heartbeat: u32,
        emit: usize,
        now: u32,
    ) -> bool {
        if node.status == status {
            return false;
        }
        if heartbeat < node.heartbeat {
            warn!(
                "Refusing to decrease known heartbeat for {} from {} to {}",
                node, node.heartbeat, heartbeat
            );
        }
        node.timestamp_ms = now;
        node.status = status;
        node.emit_counter = emit.min(i8::MAX as usize) as i8;
        node.heartbeat = node.heartbeat.max(heartbeat);
        true
    }

    fn tally(nodes: &HashMap<SocketAddrV4, Node>) -> (usize, usize, usize) {
        let live = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Alive)
            .count();
        let dead = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Dead)
            .count();
        (nodes.len(), live, dead)
    }

    /// Refreshes a peer's observation timestamp without touching status.
    pub(crate) fn touch(&self, addr: SocketAddrV4) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.timestamp_ms = self.clock.now_millis();
        }
    }

    pub(crate) fn record_ping_millis(&self, addr: SocketAddrV4, ping: PingDuration) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.ping_millis = ping;
        }
    }

    pub(crate) fn contains(&self, addr: SocketAddrV4) -> bool {
        self.nodes.read().contains_key(&addr)
    }

    pub(crate) fn get(&self, addr: SocketAddrV4) -> Option<Node> {
        self.nodes.read().get(&addr).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub(crate) fn len_with_status(&self, status: NodeStatus) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status == status)
            .count()
    }

    pub(crate) fn values(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    /// Up to `count` nodes (all of them when `count` is 0) in uniformly
    /// random order, excluded addresses filtered. The shuffle happens per
    /// call; there is no persistent iteration order to bias probing.
    pub(crate) fn get_random_nodes(&self, count: usize, exclude: &[SocketAddrV4]) -> Vec<Node> {
        let mut snapshot: Vec<Node> = {
            let nodes = self.nodes.read();
            nodes
                .values()
                .filter(|n| !exclude.contains(&n.address()))
                .cloned()
                .collect()
        };

        snapshot.shuffle(&mut thread_rng());
        if count > 0 && snapshot.len() > count {
            snapshot.truncate(count);
        }
        snapshot
    }

    /// Random non-dead relay candidates for an indirect probe.
    pub(crate) fn get_target_nodes(&self, count: usize, exclude: &[SocketAddrV4]) -> Vec<Node> {
        self.get_random_nodes(0, exclude)
            .into_iter()
            .filter(|n| n.status != NodeStatus::Dead)
            .take(count)
            .collect()
    }

    /// Members to piggyback: recently updated peers first, newest news on
    /// top. Peers whose emit counter has drained are pruned from the updated
    /// set before selection.
    pub(crate) fn get_random_updated_nodes(
        &self,
        count: usize,
        exclude: &[SocketAddrV4],
    ) -> Vec<Node> {
        let mut picks: Vec<Node> = {
            let nodes = self.nodes.read();
            let mut updated = self.updated.write();
            updated.retain(|addr| match nodes.get(addr) {
                Some(node) if node.emit_counter > 0 => true,
                _ => {
                    debug!("Removing {} from recently updated list", addr);
                    false
                }
            });
            updated
                .iter()
                .filter(|addr| !exclude.contains(addr))
                .filter_map(|addr| nodes.get(addr).cloned())
                .collect()
        };

        picks.sort_by(|a, b| b.emit_counter.cmp(&a.emit_counter));
        picks.truncate(count);
        picks
    }

    /// One decrement per piggybacked emission of this peer.
    pub(crate) fn decrement_emit(&self, addr: SocketAddrV4) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.emit_counter = node.emit_counter.saturating_sub(1);
        }
    }

    /// Swaps the coarse insert/remove notification off, reporting whether it
    /// was set. Multiple modifications collapse into one restart.
    pub(crate) fn take_modified(&self) -> bool {
        self.modified.swap(false, Ordering::Relaxed)
    }

    /// Advances the exponential-backoff counter for a Dead peer and decides
    /// whether this round should skip it, probe it, or evict it for good.
    pub(crate) fn dead_node_tick(&self, addr: SocketAddrV4) -> DeadNodeDecision {
        let mut retries = self.dead_retries.lock();
        let counter = retries.entry(addr).or_insert(DeadNodeCounter {
            retry: 1,
            countdown: 2,
        });

        counter.countdown -= 1;
        if counter.countdown > 0 {
            return DeadNodeDecision::Skip;
        }

        counter.retry += 1;
        counter.countdown = 1i32 << counter.retry.min(30);
        if counter.retry > MAX_DEAD_NODE_RETRIES {
            debug!("Forgetting dead node {}", addr);
            retries.remove(&addr);
            return DeadNodeDecision::Evict;
        }

        DeadNodeDecision::Probe
    }

    /// How many times a fresh status change should be piggybacked before the
    /// news is considered old: floor(lambda * ln(N) + 0.5).
    pub(crate) fn emit_count(&self) -> usize {
        lambda_count(self.len())
    }

    /// How many peers receive a PINGREQ when a direct probe times out. Same
    /// curve as the emit count.
    pub(crate) fn ping_request_count(&self) -> usize {
        lambda_count(self.len())
    }
}
