use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;

use parking_lot::Mutex;

/// Which response a pending-ack entry is waiting for.
///
/// `Nfp` is the non-forwarding ping a relay sends to the suspected peer when
/// fulfilling a PINGREQ; it must never be forwarded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeKind {
    Ping,
    PingReq,
    Nfp,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Ping => write!(f, "PING"),
            ProbeKind::PingReq => write!(f, "PINGREQ"),
            ProbeKind::Nfp => write!(f, "NFP"),
        }
    }
}

/// Table key. Including the heartbeat distinguishes successive probes of the
/// same peer, so a late ACK for an earlier probe cannot satisfy a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AckKey {
    pub(crate) addr: SocketAddrV4,
    pub(crate) heartbeat: u32,
}

impl fmt::Display for AckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.heartbeat)
    }
}

/// An expectation of a response to a previously emitted PING, PINGREQ or
/// NFP. Entries carry addresses only and are resolved against the registry
/// at use-time, so the table never keeps a removed peer alive.
#[derive(Debug, Clone)]
pub(crate) struct PendingAck {
    pub(crate) target: SocketAddrV4,
    pub(crate) start_time_ms: u32,
    pub(crate) callback: Option<SocketAddrV4>,
    pub(crate) callback_code: u32,
    pub(crate) kind: ProbeKind,
}

impl PendingAck {
    pub(crate) fn elapsed(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.start_time_ms)
    }
}

/// Outstanding probes, keyed `(peer address, heartbeat)`. All lookup-then-
/// modify sequences run under a single exclusive critical section.
pub(crate) struct PendingAckTable {
    entries: Mutex<HashMap<AckKey, PendingAck>>,
}

impl PendingAckTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts an entry; a duplicate key overwrites the prior entry.
    pub(crate) fn insert(&self, key: AckKey, ack: PendingAck) {
        self.entries.lock().insert(key, ack);
    }

    /// Removes and returns the entry for `key`, if present.
    pub(crate) fn take(&self, key: &AckKey) -> Option<PendingAck> {
        self.entries.lock().remove(key)
    }

    /// Sweeps the table, removing and returning every entry older than its
    /// per-kind deadline. PINGREQs wait on a full relay round-trip, so their
    /// deadline is twice the base timeout.
    pub(crate) fn take_expired(
        &self,
        now_ms: u32,
        base_timeout_ms: u32,
    ) -> Vec<(AckKey, PendingAck)> {
        let mut entries = self.entries.lock();
        let expired_keys: Vec<AckKey> = entries
            .iter()
            .filter(|(_, ack)| {
                let deadline = match ack.kind {
                    ProbeKind::PingReq => base_timeout_ms * 2,
                    _ => base_timeout_ms,
                };
                ack.elapsed(now_ms) > deadline
            })
            .map(|(key, _)| *key)
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|ack| (key, ack)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
