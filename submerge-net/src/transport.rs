use crate::{Msg, NodeID};
use submerge_base::Result;

/// The contract the replication transport and the auxiliary message
/// bus provide to the core (§1, §9): reliable ordered streams between
/// node pairs, plus a reliable message bus with per-link heartbeats.
/// The core never opens a socket itself; it only calls through this
/// trait, and is driven by the four connection-event hooks below as
/// the transport's connections come and go.
pub trait Bus: Send + Sync {
    /// Enqueue `msg` for delivery to `msg.dst`. Delivery order between
    /// two nodes is preserved; no ordering is implied across
    /// destinations.
    fn send(&self, msg: Msg) -> Result<()>;
}

/// Connection-event hooks the transport calls as peer links come up
/// and down. A receiver is the inbound half of a replication stream
/// from `peer`; a sender is the outbound half to `peer`. Both halves
/// must be up for `peer` to count as connected in either direction.
pub trait ConnectionEvents {
    fn receiver_connected(&self, peer: NodeID);
    fn receiver_disconnected(&self, peer: NodeID);
    fn sender_connected(&self, peer: NodeID);
    fn sender_disconnected(&self, peer: NodeID);
}
