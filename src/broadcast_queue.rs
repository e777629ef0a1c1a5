use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Result};
use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{BROADCAST_REMOVAL_FLOOR, MAX_BROADCAST_BYTES};
use crate::message::BroadcastFrame;

/// A broadcast as handed to the embedding application: who gossiped it into
/// the cluster, and its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBroadcast {
    pub origin: SocketAddrV4,
    pub payload: Vec<u8>,
}

/// A user broadcast waiting to ride along on outbound datagrams.
#[derive(Debug)]
struct QueuedBroadcast {
    payload: Vec<u8>,
    emit_counter: i16,
}

/// Out-of-band user broadcasts, disseminated with the same gossip cadence as
/// status updates. Each datagram carries at most one broadcast; the freshest
/// (highest counter) goes first. Counters are decremented on every outbound
/// datagram whether or not the broadcast was attached, so stale broadcasts
/// age out even in a quiet cluster.
///
/// The buffer also owns local delivery: the first sighting of a broadcast is
/// pushed to the registered subscriber, and only the first. Delivery must
/// never stall a datagram handler, so a full (or missing) subscriber channel
/// drops the hand-off and the gossip side carries on regardless.
pub(crate) struct BroadcastBuffer {
    entries: Mutex<HashMap<(SocketAddrV4, u32), QueuedBroadcast>>,

    /// Every (origin, index) pair ever accepted, so a copy gossiped back to
    /// us after local eviction is not re-queued or re-delivered.
    seen: Mutex<HashSet<(SocketAddrV4, u32)>>,

    subscriber: Mutex<Option<mpsc::Sender<ReceivedBroadcast>>>,

    next_index: AtomicU32,
}

impl BroadcastBuffer {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            subscriber: Mutex::new(None),
            next_index: AtomicU32::new(0),
        }
    }

    /// Registers the local consumer of cluster broadcasts, replacing any
    /// previous registration. Broadcasts seen before this point are gone.
    pub(crate) fn subscribe(&self, buffer: usize) -> mpsc::Receiver<ReceivedBroadcast> {
        let (tx, rx) = mpsc::channel(buffer);
        *self.subscriber.lock() = Some(tx);
        rx
    }

    fn deliver(&self, origin: SocketAddrV4, payload: Vec<u8>) {
        let subscriber = self.subscriber.lock();
        match subscriber.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.try_send(ReceivedBroadcast { origin, payload }) {
                    debug!("Broadcast from {} not delivered locally: {}", origin, e);
                }
            }
            None => debug!("Broadcast from {} has no local receiver", origin),
        }
    }

    /// Queues a broadcast originated by this endpoint.
    pub(crate) fn queue_local(
        &self,
        origin: SocketAddrV4,
        payload: Vec<u8>,
        emit_counter: i16,
    ) -> Result<()> {
        if payload.len() > MAX_BROADCAST_BYTES {
            return Err(anyhow!(
                "broadcast payload too large, allowed {} bytes but got {} bytes",
                MAX_BROADCAST_BYTES,
                payload.len()
            ));
        }

        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().insert((origin, index));
        self.entries.lock().insert(
            (origin, index),
            QueuedBroadcast {
                payload,
                emit_counter,
            },
        );
        Ok(())
    }

    /// Accepts a broadcast received from a peer: queues it for further
    /// re-emission and, on first sighting only, hands the payload to the
    /// subscriber. Returns whether this sighting was the first.
    pub(crate) fn receive(&self, frame: BroadcastFrame, emit_counter: i16) -> bool {
        let key = (frame.origin, frame.index);
        if !self.seen.lock().insert(key) {
            return false;
        }

        self.entries.lock().insert(
            key,
            QueuedBroadcast {
                payload: frame.payload.clone(),
                emit_counter,
            },
        );
        self.deliver(frame.origin, frame.payload);
        true
    }

    /// Picks the broadcast to attach to the next outbound datagram, if any.
    ///
    /// The highest-counter pending broadcast is chosen and its counter is
    /// decremented unconditionally; it is only attached while the counter is
    /// still positive, and dropped entirely below the removal floor.
    pub(crate) fn next_to_emit(&self) -> Option<BroadcastFrame> {
        let mut entries = self.entries.lock();

        let key = *entries
            .iter()
            .max_by_key(|(_, queued)| queued.emit_counter)?
            .0;

        let queued = entries.get_mut(&key).expect("key taken from iteration");
        let attach = queued.emit_counter > 0;
        queued.emit_counter -= 1;

        let frame = attach.then(|| BroadcastFrame {
            origin: key.0,
            index: key.1,
            payload: queued.payload.clone(),
        });

        if queued.emit_counter < BROADCAST_REMOVAL_FLOOR {
            debug!("Dropping aged-out broadcast from {}:{}", key.0, key.1);
            entries.remove(&key);
        }

        frame
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
