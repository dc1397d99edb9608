//! Component B: maintains the bidirectional-connectivity matrix from
//! heartbeats and computes the maximum clique (§4.2).

use std::sync::{Arc, RwLock};

use submerge_base::NodeMask;
use submerge_net::{Generation, NodeID};

use crate::notify::Notifier;

/// Heartbeat payload fields relevant to connectivity; the generation
/// fields are handed back to the caller so it can forward them to the
/// Generation Manager (ownership stays split per §3's "Ownership"
/// rule: the tracker never reaches into generation state itself).
pub struct HeartbeatInfo {
    pub peer_connected_mask: NodeMask,
    pub peer_current_gen: Generation,
    pub peer_donors: NodeMask,
    pub peer_last_online_in: u64,
}

struct Inner {
    /// `matrix[i]`: node `i`'s last-reported connected mask. Index 0
    /// is unused (node ids are 1-based); `matrix[me]` is derived
    /// locally from transport hooks, not gossiped to itself.
    matrix: [NodeMask; 65],
    others_last_online_in: [u64; 65],
    send_connected: NodeMask,
    recv_connected: NodeMask,
}

pub struct ConnectivityTracker {
    me: NodeID,
    inner: RwLock<Inner>,
    wake_campaigner: Arc<Notifier>,
}

impl ConnectivityTracker {
    pub fn new(me: NodeID, wake_campaigner: Arc<Notifier>) -> Self {
        ConnectivityTracker {
            me,
            inner: RwLock::new(Inner {
                matrix: [NodeMask::EMPTY; 65],
                others_last_online_in: [0; 65],
                send_connected: NodeMask::EMPTY,
                recv_connected: NodeMask::EMPTY,
            }),
            wake_campaigner,
        }
    }

    fn recompute_self_row(&self, inner: &mut Inner) {
        let mine = inner.send_connected.intersect(&inner.recv_connected);
        inner.matrix[self.me.get() as usize] = mine;
    }

    pub fn receiver_connected(&self, peer: NodeID) {
        let mut inner = self.inner.write().unwrap();
        inner.recv_connected.set(peer.get(), true);
        self.recompute_self_row(&mut inner);
        drop(inner);
        self.wake_campaigner.notify();
    }

    pub fn receiver_disconnected(&self, peer: NodeID) {
        let mut inner = self.inner.write().unwrap();
        inner.recv_connected.set(peer.get(), false);
        self.recompute_self_row(&mut inner);
        drop(inner);
        self.wake_campaigner.notify();
    }

    pub fn sender_connected(&self, peer: NodeID) {
        let mut inner = self.inner.write().unwrap();
        inner.send_connected.set(peer.get(), true);
        self.recompute_self_row(&mut inner);
        drop(inner);
        self.wake_campaigner.notify();
    }

    pub fn sender_disconnected(&self, peer: NodeID) {
        let mut inner = self.inner.write().unwrap();
        inner.send_connected.set(peer.get(), false);
        self.recompute_self_row(&mut inner);
        drop(inner);
        self.wake_campaigner.notify();
    }

    /// Records a gossiped heartbeat from `peer`. Returns the
    /// generation-related fields for the caller to forward into
    /// `GenerationManager::consider_gen_switch`/status bookkeeping.
    pub fn heartbeat(&self, peer: NodeID, info: HeartbeatInfo) -> (Generation, NodeMask, u64) {
        let mut inner = self.inner.write().unwrap();
        let changed = inner.matrix[peer.get() as usize] != info.peer_connected_mask;
        inner.matrix[peer.get() as usize] = info.peer_connected_mask;
        inner.others_last_online_in[peer.get() as usize] = info.peer_last_online_in;
        drop(inner);
        if changed {
            self.wake_campaigner.notify();
        }
        (info.peer_current_gen, info.peer_donors, info.peer_last_online_in)
    }

    pub fn connected_mask(&self) -> NodeMask {
        self.inner.read().unwrap().matrix[self.me.get() as usize]
    }

    pub fn others_last_online_in(&self, peer: NodeID) -> u64 {
        self.inner.read().unwrap().others_last_online_in[peer.get() as usize]
    }

    /// The largest subset `S` of `universe` such that every pair in
    /// `S` bidirectionally sees each other (i.e. both endpoints report
    /// the edge). A size-1 result is rewritten to `{me}` to handle the
    /// single-configured-node case, where Bron-Kerbosch would return a
    /// fixed singleton regardless of which node is asking.
    pub fn clique(&self, universe: NodeMask) -> NodeMask {
        let inner = self.inner.read().unwrap();
        let adj = symmetrize(&inner.matrix, universe);
        drop(inner);

        let mut best = NodeMask::EMPTY;
        bron_kerbosch(NodeMask::EMPTY, universe, NodeMask::EMPTY, &adj, &mut best);

        if best.count() <= 1 {
            NodeMask::single(self.me.get())
        } else {
            best
        }
    }
}

/// Drop any edge not reported by both endpoints.
fn symmetrize(matrix: &[NodeMask; 65], universe: NodeMask) -> [NodeMask; 65] {
    let mut adj = [NodeMask::EMPTY; 65];
    for i in universe.iter() {
        for j in universe.iter() {
            if i == j {
                continue;
            }
            if matrix[i as usize].contains(j) && matrix[j as usize].contains(i) {
                adj[i as usize].set(j, true);
            }
        }
    }
    adj
}

/// Bron-Kerbosch with pivoting over node-id bitmasks. Worst case is
/// exponential in `|universe|`, acceptable because clusters here are
/// bounded at 64 nodes and in practice far smaller (§4.2).
fn bron_kerbosch(
    r: NodeMask,
    mut p: NodeMask,
    mut x: NodeMask,
    adj: &[NodeMask; 65],
    best: &mut NodeMask,
) {
    if p.is_empty() && x.is_empty() {
        if r.count() > best.count() {
            *best = r;
        }
        return;
    }

    let pivot = p
        .union(&x)
        .iter()
        .next()
        .expect("p union x non-empty by loop guard above");
    let candidates = p.subtract(&adj[pivot as usize]);

    for v in candidates.iter() {
        let nv = adj[v as usize];
        bron_kerbosch(
            r.union(&NodeMask::single(v)),
            p.intersect(&nv),
            x.intersect(&nv),
            adj,
            best,
        );
        p.set(v, false);
        x.set(v, true);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn tracker(me: NodeID) -> ConnectivityTracker {
        ConnectivityTracker::new(me, Arc::new(crate::notify::Notifier::new()))
    }

    fn mask(ids: impl IntoIterator<Item = u8>) -> NodeMask {
        NodeMask::from_ids(ids)
    }

    fn full_heartbeat(peer_connected_mask: NodeMask) -> HeartbeatInfo {
        HeartbeatInfo {
            peer_connected_mask,
            peer_current_gen: Generation::INITIAL,
            peer_donors: NodeMask::EMPTY,
            peer_last_online_in: 0,
        }
    }

    #[test]
    fn three_node_full_mesh_is_one_clique() {
        let t = tracker(NodeID(1));
        t.sender_connected(NodeID(2));
        t.sender_connected(NodeID(3));
        t.receiver_connected(NodeID(2));
        t.receiver_connected(NodeID(3));
        t.heartbeat(NodeID(2), full_heartbeat(mask([1, 3])));
        t.heartbeat(NodeID(3), full_heartbeat(mask([1, 2])));

        let clique = t.clique(mask([1, 2, 3]));
        assert_eq!(clique, mask([1, 2, 3]));
    }

    #[test]
    fn asymmetric_edge_is_dropped() {
        // Node 2 claims to see node 3, but node 3 doesn't claim to see
        // node 2 back: the edge must not count.
        let t = tracker(NodeID(1));
        t.sender_connected(NodeID(2));
        t.receiver_connected(NodeID(2));
        t.sender_connected(NodeID(3));
        t.receiver_connected(NodeID(3));
        t.heartbeat(NodeID(2), full_heartbeat(mask([1, 3])));
        t.heartbeat(NodeID(3), full_heartbeat(mask([1])));

        let clique = t.clique(mask([1, 2, 3]));
        // {1,2} and {1,3} both bidirectional, {2,3} is not: max clique
        // size 2, and ties are broken by traversal order, but it must
        // always include node 1.
        assert_eq!(clique.count(), 2);
        assert!(clique.contains(1));
    }

    #[test]
    fn singleton_clique_rewritten_to_self() {
        let t = tracker(NodeID(2));
        // Nobody connected to anybody; clique of {2} alone among
        // universe {1,2} triggers BK returning size-1 (node 1, say),
        // which must be rewritten to {me}.
        let clique = t.clique(mask([1, 2]));
        assert_eq!(clique, mask([2]));
    }

    #[test]
    fn two_vs_two_split_has_no_shared_clique_larger_than_two() {
        let t = tracker(NodeID(1));
        t.sender_connected(NodeID(2));
        t.receiver_connected(NodeID(2));
        t.heartbeat(NodeID(2), full_heartbeat(mask([1])));
        t.heartbeat(NodeID(3), full_heartbeat(mask([4])));
        t.heartbeat(NodeID(4), full_heartbeat(mask([3])));

        let clique = t.clique(mask([1, 2, 3, 4]));
        assert_eq!(clique.count(), 2);
        assert!(clique.contains(1) && clique.contains(2));
    }
}
