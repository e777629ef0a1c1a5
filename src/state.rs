use std::fmt;

use anyhow::{anyhow, Result};

/// The status a peer can hold in the local registry.
///
/// `ForwardTo` is deliberately absent: it is a wire-only marker (see
/// [`WireStatus`]) and can never be persisted as a peer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Unknown,
    Alive,
    Dead,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "UNKNOWN"),
            NodeStatus::Alive => write!(f, "ALIVE"),
            NodeStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// Status byte as it appears inside a member record on the wire. The extra
/// `ForwardTo` variant tags the first member of a PINGREQ as the probe
/// target; it never reaches the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireStatus {
    Unknown,
    Alive,
    Dead,
    ForwardTo,
}

impl WireStatus {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(WireStatus::Unknown),
            1 => Ok(WireStatus::Alive),
            2 => Ok(WireStatus::Dead),
            3 => Ok(WireStatus::ForwardTo),
            _ => Err(anyhow!("invalid wire status value: {}", value)),
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            WireStatus::Unknown => 0,
            WireStatus::Alive => 1,
            WireStatus::Dead => 2,
            WireStatus::ForwardTo => 3,
        }
    }

    /// Maps this wire status onto a registry status. `None` for `ForwardTo`,
    /// which carries routing information rather than peer state.
    pub(crate) fn to_node_status(self) -> Option<NodeStatus> {
        match self {
            WireStatus::Unknown => Some(NodeStatus::Unknown),
            WireStatus::Alive => Some(NodeStatus::Alive),
            WireStatus::Dead => Some(NodeStatus::Dead),
            WireStatus::ForwardTo => None,
        }
    }
}

impl From<NodeStatus> for WireStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Unknown => WireStatus::Unknown,
            NodeStatus::Alive => WireStatus::Alive,
            NodeStatus::Dead => WireStatus::Dead,
        }
    }
}

impl fmt::Display for WireStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireStatus::Unknown => write!(f, "UNKNOWN"),
            WireStatus::Alive => write!(f, "ALIVE"),
            WireStatus::Dead => write!(f, "DEAD"),
            WireStatus::ForwardTo => write!(f, "FORWARD_TO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_status_round_trip() {
        for value in 0..=3u8 {
            let status = WireStatus::from_u8(value).unwrap();
            assert_eq!(status.as_u8(), value);
        }
        assert!(WireStatus::from_u8(4).is_err());
    }

    #[test]
    fn test_forward_to_has_no_registry_status() {
        assert_eq!(WireStatus::ForwardTo.to_node_status(), None);
        assert_eq!(
            WireStatus::Alive.to_node_status(),
            Some(NodeStatus::Alive)
        );
    }

    #[test]
    fn test_registry_status_maps_onto_wire() {
        assert_eq!(WireStatus::from(NodeStatus::Dead), WireStatus::Dead);
        assert_eq!(WireStatus::from(NodeStatus::Unknown), WireStatus::Unknown);
    }
}
