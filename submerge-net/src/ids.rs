use serde::{Deserialize, Serialize};

/// A node's identity within a realm. 1-based; see `submerge_base::N_MAX`
/// for the upper bound a `NodeMask` can represent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeID(pub u8);

impl NodeID {
    pub fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for NodeID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster-unique, monotonically-increasing transaction global id, of
/// the form `MTM-<coordinator_node_id>-<coordinator_pid>-<local_counter>`.
/// ASCII, bounded to 200 bytes on the wire.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Gid(String);

impl Gid {
    pub const MAX_LEN: usize = 200;

    pub fn new(coordinator: NodeID, coordinator_pid: u32, counter: u64) -> Self {
        let s = format!("MTM-{}-{}-{}", coordinator.get(), coordinator_pid, counter);
        debug_assert!(s.is_ascii());
        debug_assert!(s.len() <= Self::MAX_LEN);
        Gid(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an already-formatted gid without reparsing its
    /// coordinator/pid/counter fields — for reconstructing a `Gid`
    /// from a bare wire `String` (e.g. `BusMsg::TxRequest.gid`)
    /// instead of minting a fresh one with `new`.
    pub fn from_wire(s: impl Into<String>) -> Self {
        Gid(s.into())
    }

    /// The node id embedded in the gid, i.e. the originating coordinator.
    pub fn coordinator(&self) -> Option<NodeID> {
        let mut parts = self.0.split('-');
        if parts.next()? != "MTM" {
            return None;
        }
        parts.next()?.parse::<u8>().ok().map(NodeID)
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gid_format_and_parse_back() {
        let gid = Gid::new(NodeID(3), 4242, 17);
        assert_eq!(gid.as_str(), "MTM-3-4242-17");
        assert_eq!(gid.coordinator(), Some(NodeID(3)));
    }
}
