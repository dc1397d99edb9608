use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use submerge_base::Result;
use submerge_net::{Bus, Msg, NodeID};

fn unordered_pair(a: NodeID, b: NodeID) -> (u8, u8) {
    if a.get() <= b.get() {
        (a.get(), b.get())
    } else {
        (b.get(), a.get())
    }
}

struct Inner {
    /// Per-destination inbox, mirroring `submerge_net::IOQueues`'s
    /// `VecDeque<(NodeID, Box<[u8]>)>` shape but keeping `Msg` values
    /// directly since the fabric never actually serializes bytes.
    inboxes: std::collections::HashMap<u8, VecDeque<Msg>>,
    /// Unordered node pairs currently partitioned; a message whose
    /// `(src, dst)` pair is in here is silently dropped.
    down_links: HashSet<(u8, u8)>,
}

/// A shared in-memory fabric standing in for the real replication
/// transport and message bus: every node's `FabricBus` handle delivers
/// into the same `Fabric`, letting a whole small cluster run as plain
/// threads in one process.
pub struct Fabric {
    inner: Mutex<Inner>,
}

impl Fabric {
    pub fn new() -> Arc<Fabric> {
        Arc::new(Fabric {
            inner: Mutex::new(Inner {
                inboxes: std::collections::HashMap::new(),
                down_links: HashSet::new(),
            }),
        })
    }

    /// A `Bus` handle for `node` backed by this fabric.
    pub fn bus_for(self: &Arc<Self>, node: NodeID) -> FabricBus {
        FabricBus {
            me: node,
            fabric: self.clone(),
        }
    }

    fn deliver(&self, msg: Msg) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.down_links.contains(&unordered_pair(msg.src, msg.dst)) {
            return Ok(());
        }
        inner.inboxes.entry(msg.dst.get()).or_default().push_back(msg);
        Ok(())
    }

    /// Pops the oldest undelivered message addressed to `node`, if any.
    pub fn recv(&self, node: NodeID) -> Option<Msg> {
        self.inner.lock().unwrap().inboxes.entry(node.get()).or_default().pop_front()
    }

    /// Drains every message currently queued for `node`, in order.
    pub fn drain(&self, node: NodeID) -> Vec<Msg> {
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.entry(node.get()).or_default().drain(..).collect()
    }

    /// Cuts the link between `a` and `b` in both directions. Messages
    /// already queued are unaffected; only new sends are dropped.
    pub fn partition(&self, a: NodeID, b: NodeID) {
        self.inner.lock().unwrap().down_links.insert(unordered_pair(a, b));
    }

    /// Restores a previously cut link.
    pub fn heal(&self, a: NodeID, b: NodeID) {
        self.inner.lock().unwrap().down_links.remove(&unordered_pair(a, b));
    }

    pub fn is_partitioned(&self, a: NodeID, b: NodeID) -> bool {
        self.inner.lock().unwrap().down_links.contains(&unordered_pair(a, b))
    }
}

/// One node's handle onto a shared `Fabric`, implementing
/// `submerge_net::Bus` so it can be handed straight to a `Campaigner`
/// or `TransactionCoordinator` under test.
pub struct FabricBus {
    me: NodeID,
    fabric: Arc<Fabric>,
}

impl FabricBus {
    pub fn me(&self) -> NodeID {
        self.me
    }

    pub fn recv(&self) -> Option<Msg> {
        self.fabric.recv(self.me)
    }

    pub fn drain(&self) -> Vec<Msg> {
        self.fabric.drain(self.me)
    }
}

impl Bus for FabricBus {
    fn send(&self, msg: Msg) -> Result<()> {
        self.fabric.deliver(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use submerge_net::BusMsg;
    use test_log::test;

    fn heartbeat(src: NodeID, dst: NodeID) -> Msg {
        Msg::request(
            src,
            dst,
            1,
            BusMsg::Heartbeat {
                sender_connected_mask: submerge_base::NodeMask::EMPTY,
                sender_current_gen: submerge_net::Generation::INITIAL,
                sender_donors: submerge_base::NodeMask::EMPTY,
                sender_last_online_in: 0,
            },
        )
    }

    #[test]
    fn message_delivered_to_destination_inbox_only() {
        let fabric = Fabric::new();
        let b1 = fabric.bus_for(NodeID(1));
        let b2 = fabric.bus_for(NodeID(2));
        b1.send(heartbeat(NodeID(1), NodeID(2))).unwrap();
        assert!(b2.recv().is_some());
        assert!(fabric.bus_for(NodeID(3)).recv().is_none());
    }

    #[test]
    fn partitioned_link_drops_silently() {
        let fabric = Fabric::new();
        fabric.partition(NodeID(1), NodeID(2));
        let b1 = fabric.bus_for(NodeID(1));
        b1.send(heartbeat(NodeID(1), NodeID(2))).unwrap();
        assert!(fabric.bus_for(NodeID(2)).recv().is_none());
    }

    #[test]
    fn healing_restores_delivery() {
        let fabric = Fabric::new();
        fabric.partition(NodeID(1), NodeID(2));
        fabric.heal(NodeID(1), NodeID(2));
        let b1 = fabric.bus_for(NodeID(1));
        b1.send(heartbeat(NodeID(1), NodeID(2))).unwrap();
        assert!(fabric.bus_for(NodeID(2)).recv().is_some());
    }

    #[test]
    fn drain_returns_all_queued_messages_in_order() {
        let fabric = Fabric::new();
        let b1 = fabric.bus_for(NodeID(1));
        b1.send(heartbeat(NodeID(1), NodeID(2))).unwrap();
        b1.send(heartbeat(NodeID(1), NodeID(2))).unwrap();
        let drained = fabric.bus_for(NodeID(2)).drain();
        assert_eq!(drained.len(), 2);
    }
}
