use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{anyhow, Result};

use crate::node::Node;
use crate::state::WireStatus;

/// Datagram verbs. Every message carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verb {
    Ping,
    Ack,
    PingRequest,
    NonForwardingPing,
}

impl Verb {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Verb::Ping),
            1 => Ok(Verb::Ack),
            2 => Ok(Verb::PingRequest),
            3 => Ok(Verb::NonForwardingPing),
            _ => Err(anyhow!("invalid verb value: {}", value)),
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Verb::Ping => 0,
            Verb::Ack => 1,
            Verb::PingRequest => 2,
            Verb::NonForwardingPing => 3,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Ping => write!(f, "PING"),
            Verb::Ack => write!(f, "ACK"),
            Verb::PingRequest => write!(f, "PINGREQ"),
            Verb::NonForwardingPing => write!(f, "NFP"),
        }
    }
}

/// A member record piggybacked on a datagram: 11 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemberRecord {
    pub(crate) ip: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) status: WireStatus,
    pub(crate) heartbeat: u32,
}

impl MemberRecord {
    pub(crate) fn address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Snapshot of a registry node for dissemination.
    pub(crate) fn from_node(node: &Node) -> Self {
        Self {
            ip: node.ip,
            port: node.port,
            status: node.status.into(),
            heartbeat: node.heartbeat,
        }
    }

    /// The marker record at the head of a PINGREQ naming the probe target.
    pub(crate) fn forward_to(target: SocketAddrV4, code: u32) -> Self {
        Self {
            ip: *target.ip(),
            port: target.port(),
            status: WireStatus::ForwardTo,
            heartbeat: code,
        }
    }
}

/// The optional broadcast trailer. `(origin, index)` identifies a broadcast
/// across the cluster so re-received copies are recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BroadcastFrame {
    pub(crate) origin: SocketAddrV4,
    pub(crate) index: u32,
    pub(crate) payload: Vec<u8>,
}

/// A decoded (or to-be-encoded) datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub(crate) verb: Verb,
    pub(crate) sender: SocketAddrV4,
    pub(crate) sender_heartbeat: u32,
    pub(crate) members: Vec<MemberRecord>,
    pub(crate) broadcast: Option<BroadcastFrame>,
}

impl Message {
    pub(crate) fn new(verb: Verb, sender: SocketAddrV4, sender_heartbeat: u32) -> Self {
        Self {
            verb,
            sender,
            sender_heartbeat,
            members: Vec::new(),
            broadcast: None,
        }
    }

    pub(crate) fn add_member(&mut self, member: MemberRecord) -> Result<()> {
        if self.members.len() >= usize::from(u8::MAX) {
            return Err(anyhow!("member list full"));
        }
        self.members.push(member);
        Ok(())
    }

    pub(crate) fn add_broadcast(&mut self, broadcast: BroadcastFrame) {
        self.broadcast = Some(broadcast);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip() {
        for value in 0..=3u8 {
            assert_eq!(Verb::from_u8(value).unwrap().as_u8(), value);
        }
        assert!(Verb::from_u8(9).is_err());
    }

    #[test]
    fn test_forward_to_record_carries_code() {
        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9999);
        let record = MemberRecord::forward_to(target, 77);
        assert_eq!(record.address(), target);
        assert_eq!(record.status, WireStatus::ForwardTo);
        assert_eq!(record.heartbeat, 77);
    }

    #[test]
    fn test_member_record_snapshots_node() {
        let mut node = Node::new(Ipv4Addr::new(10, 0, 0, 3), 9998);
        node.status = crate::state::NodeStatus::Alive;
        node.heartbeat = 12;

        let record = MemberRecord::from_node(&node);
        assert_eq!(record.status, WireStatus::Alive);
        assert_eq!(record.heartbeat, 12);
        assert_eq!(record.address(), node.address());
    }
}
