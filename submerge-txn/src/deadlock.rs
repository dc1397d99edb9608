//! Component I: periodic exchange of local wait-for subgraphs and
//! cross-node cycle detection (§4.9).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use submerge_base::Result;
use submerge_net::{BusMsg, LogicalRecord, Msg, NodeID, WaitEdge};

/// A vertex in the wait-for graph: a transaction identified by the
/// node it runs on plus its local transaction id, mirroring the
/// engine's own lock-manager vocabulary rather than inventing a new
/// cluster-wide id (gids aren't assigned until PREPARE, but locks are
/// held from the first write).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Vertex {
    pub node: NodeID,
    pub xid: u32,
}

/// The merged cross-node wait-for graph (§4.9): `edges[a]` is the set
/// of vertices `a` is waiting on.
#[derive(Default)]
pub struct WaitForGraph {
    edges: HashMap<Vertex, HashSet<Vertex>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        WaitForGraph::default()
    }

    /// Replaces this node's own local subgraph (the portion the
    /// engine introspects directly) before merging in peers'. Each
    /// entry is `(waiter_xid, holder)`: the holder may itself be a
    /// vertex on a different node, since a local backend can be
    /// blocked on a lock a remote replicated transaction holds.
    pub fn set_local_edges(&mut self, node: NodeID, local: impl IntoIterator<Item = (u32, Vertex)>) {
        self.edges.retain(|v, _| v.node != node);
        for (waiter, holder) in local {
            self.edges.entry(Vertex { node, xid: waiter }).or_default().insert(holder);
        }
    }

    /// Merges a peer's gossiped subgraph, replacing whatever that peer
    /// previously contributed (each peer's submission is authoritative
    /// for its own vertices, per §4.9 "merges all received subgraphs").
    pub fn merge_peer_subgraph(&mut self, peer: NodeID, edges: impl IntoIterator<Item = (Vertex, Vertex)>) {
        self.edges.retain(|v, _| v.node != peer);
        for (from, to) in edges {
            debug_assert_eq!(from.node, peer);
            self.edges.entry(from).or_default().insert(to);
        }
    }

    /// True if a cycle exists reachable from `root` — the check run
    /// "whenever the engine suspects deadlock" (§4.9), rooted at the
    /// local xid that's stalled.
    pub fn has_cycle_from(&self, root: Vertex) -> bool {
        let mut visiting = HashSet::new();
        let mut path = Vec::new();
        self.dfs(root, &mut visiting, &mut path)
    }

    fn dfs(&self, v: Vertex, visiting: &mut HashSet<Vertex>, path: &mut Vec<Vertex>) -> bool {
        if path.contains(&v) {
            return true;
        }
        if !visiting.insert(v) {
            return false;
        }
        path.push(v);
        let found = self
            .edges
            .get(&v)
            .map(|next| next.iter().any(|&w| self.dfs(w, visiting, path)))
            .unwrap_or(false);
        path.pop();
        found
    }

    /// This node's own portion of the merged graph (every edge whose
    /// waiter lives on `node`) — what §4.9 says to log to the WAL and
    /// gossip to peers on the same cadence.
    fn local_edges_for(&self, node: NodeID) -> Vec<WaitEdge> {
        self.edges
            .iter()
            .filter(|(v, _)| v.node == node)
            .flat_map(|(v, holders)| {
                holders.iter().map(move |h| WaitEdge {
                    waiter_node: v.node,
                    waiter_xid: v.xid,
                    holder_node: h.node,
                    holder_xid: h.xid,
                })
            })
            .collect()
    }
}

/// Tracks apply-worker progress so a stalled pool can be treated as
/// deadlock evidence even without a graph loop (§4.9 last sentence).
pub struct StallTracker {
    last_progress_ticks: AtomicU64,
    tick: AtomicU64,
}

impl StallTracker {
    pub fn new() -> Self {
        StallTracker {
            last_progress_ticks: AtomicU64::new(0),
            tick: AtomicU64::new(0),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn note_progress(&self) {
        self.last_progress_ticks
            .store(self.tick.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Stalled once `stall_ticks` ticks have elapsed since the last
    /// recorded progress.
    pub fn is_stalled(&self, stall_ticks: u64) -> bool {
        self.tick.load(Ordering::Relaxed) - self.last_progress_ticks.load(Ordering::Relaxed) >= stall_ticks
    }
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges subgraphs and answers cycle queries; owns both the merged
/// graph and the stall tracker behind one lock since both feed the
/// same "is this a deadlock" decision (§4.9).
pub struct DeadlockDetector {
    graph: Mutex<WaitForGraph>,
    stall: StallTracker,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        DeadlockDetector {
            graph: Mutex::new(WaitForGraph::new()),
            stall: StallTracker::new(),
        }
    }

    pub fn set_local_edges(&self, node: NodeID, local: impl IntoIterator<Item = (u32, Vertex)>) {
        self.graph.lock().unwrap().set_local_edges(node, local);
    }

    pub fn merge_peer_subgraph(&self, peer: NodeID, edges: impl IntoIterator<Item = (Vertex, Vertex)>) {
        self.graph.lock().unwrap().merge_peer_subgraph(peer, edges);
    }

    pub fn note_apply_progress(&self) {
        self.stall.note_progress();
    }

    pub fn tick(&self) -> u64 {
        self.stall.tick()
    }

    /// Whether `root` should be aborted as a deadlock victim: either a
    /// real cycle is found in the merged graph, or the apply pool has
    /// been stalled for at least `stall_ticks` ticks.
    pub fn should_abort(&self, root: Vertex, stall_ticks: u64) -> bool {
        self.graph.lock().unwrap().has_cycle_from(root) || self.stall.is_stalled(stall_ticks)
    }

    /// §4.9: "each node periodically logs its subgraph to its WAL and
    /// also pushes it to the bus". Builds both outgoing forms of this
    /// node's own share of the graph; the caller is responsible for
    /// actually writing/sending them through its `LogSink`/`Bus`
    /// handles, the same split `Campaigner`/`Resolver` use for their
    /// own broadcasts.
    pub fn publish(&self, node: NodeID) -> Result<(LogicalRecord, BusMsg)> {
        let edges = self.graph.lock().unwrap().local_edges_for(node);
        let payload = rmp_serde::to_vec(&edges)?;
        Ok((LogicalRecord::LockGraph { payload }, BusMsg::LockGraph { edges }))
    }

    /// Incoming `BusMsg::LockGraph` gossip (§4.9): merges it into the
    /// local copy of the cross-node wait-for graph. No-op for any
    /// other message shape, so callers can hand every inbound `Msg`
    /// straight through without pre-filtering.
    pub fn handle_msg(&self, msg: &Msg) {
        let BusMsg::LockGraph { edges } = &msg.body else {
            return;
        };
        let converted = edges.iter().map(|e| {
            (
                Vertex { node: e.waiter_node, xid: e.waiter_xid },
                Vertex { node: e.holder_node, xid: e.holder_xid },
            )
        });
        self.merge_peer_subgraph(msg.src, converted);
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn v(node: u8, xid: u32) -> Vertex {
        Vertex { node: NodeID(node), xid }
    }

    #[test]
    fn local_only_cycle_detected() {
        let mut g = WaitForGraph::new();
        g.set_local_edges(NodeID(1), [(1, v(1, 2)), (2, v(1, 1))]);
        assert!(g.has_cycle_from(v(1, 1)));
    }

    #[test]
    fn acyclic_chain_is_not_a_cycle() {
        let mut g = WaitForGraph::new();
        g.set_local_edges(NodeID(1), [(1, v(1, 2)), (2, v(1, 3))]);
        assert!(!g.has_cycle_from(v(1, 1)));
    }

    #[test]
    fn cross_node_cycle_requires_merge() {
        let mut g = WaitForGraph::new();
        // node1/xid1 waits on node2/xid5 (a remote lock holder).
        g.set_local_edges(NodeID(1), [(1, v(2, 5))]);
        // Before node2 gossips its subgraph, no cycle is visible.
        assert!(!g.has_cycle_from(v(1, 1)));
        // node2/xid5 waits back on node1/xid1, closing the loop.
        g.merge_peer_subgraph(NodeID(2), [(v(2, 5), v(1, 1))]);
        assert!(g.has_cycle_from(v(1, 1)));
    }

    #[test]
    fn stall_tracker_flags_after_n_ticks_without_progress() {
        let s = StallTracker::new();
        for _ in 0..5 {
            s.tick();
        }
        assert!(s.is_stalled(3));
        s.note_progress();
        assert!(!s.is_stalled(3));
    }

    #[test]
    fn detector_aborts_on_stall_even_without_cycle() {
        let d = DeadlockDetector::new();
        for _ in 0..10 {
            d.tick();
        }
        assert!(d.should_abort(v(1, 1), 5));
    }

    #[test]
    fn publish_emits_only_this_nodes_own_edges() {
        let d = DeadlockDetector::new();
        d.set_local_edges(NodeID(1), [(1, v(2, 5))]);
        let (record, msg) = d.publish(NodeID(1)).unwrap();
        let BusMsg::LockGraph { edges } = &msg else { panic!("wrong variant") };
        assert_eq!(
            edges,
            &vec![WaitEdge {
                waiter_node: NodeID(1),
                waiter_xid: 1,
                holder_node: NodeID(2),
                holder_xid: 5,
            }]
        );
        let LogicalRecord::LockGraph { payload } = &record else { panic!("wrong variant") };
        let decoded: Vec<WaitEdge> = rmp_serde::from_slice(payload).unwrap();
        assert_eq!(&decoded, edges);

        // node2's own publish never includes node1's edges.
        let (_, msg2) = d.publish(NodeID(2)).unwrap();
        assert_eq!(msg2, BusMsg::LockGraph { edges: vec![] });
    }

    #[test]
    fn handle_msg_merges_gossiped_cycle() {
        let d = DeadlockDetector::new();
        d.set_local_edges(NodeID(1), [(1, v(2, 5))]);
        assert!(!d.should_abort(v(1, 1), u64::MAX));

        let gossip = Msg::request(
            NodeID(2),
            NodeID(1),
            0,
            BusMsg::LockGraph {
                edges: vec![WaitEdge {
                    waiter_node: NodeID(2),
                    waiter_xid: 5,
                    holder_node: NodeID(1),
                    holder_xid: 1,
                }],
            },
        );
        d.handle_msg(&gossip);
        assert!(d.should_abort(v(1, 1), u64::MAX));
    }

    #[test]
    fn handle_msg_ignores_unrelated_messages() {
        let d = DeadlockDetector::new();
        d.handle_msg(&Msg::request(NodeID(2), NodeID(1), 0, BusMsg::LastTermRequest));
        assert!(!d.should_abort(v(1, 1), u64::MAX));
    }
}
