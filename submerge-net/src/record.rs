use crate::NodeID;
use serde::{Deserialize, Serialize};
use submerge_base::NodeMask;

/// Logical records the core emits into the replication stream (§6).
/// Each carries a single-byte type tag on the wire; the engine's WAL
/// plug-in is responsible for framing these alongside row-change
/// records, which are out of scope here (§1 Non-goals).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LogicalRecord {
    /// `P` — marks "every prepare of every generation `< gen_num` has
    /// preceded this point from this donor". Emitted at gen switch on
    /// donors; the synchronization watermark applying peers cross
    /// exactly once per generation transition.
    ParallelSafe {
        gen_num: u64,
        members: NodeMask,
        configured: NodeMask,
        donors: NodeMask,
    },
    /// `S` — emitted once per read-committed snapshot acquisition
    /// during a distributed transaction.
    Snapshot { csn: u64 },
    /// `A` — emitted by a participant that refused a prepare.
    Abort {
        gid: String,
        origin_node: NodeID,
        origin_lsn: u64,
    },
    /// `L` — opaque serialized wait-for subgraph for deadlock
    /// detection (§4.9). The graph encoding itself is the engine's
    /// concern; the core only ferries the bytes.
    LockGraph { payload: Vec<u8> },
    /// `N` — monotonic sequence-value tracking.
    SequenceNext { seqid: u64, next: i64 },
    /// `B` — bulk table copy directive.
    BroadcastTable { source_oid: u64, target_mask: NodeMask },
    /// `D` — DDL, transactional: participates in 3PC like any other
    /// write.
    DdlTransactional { sql: String, guc_prelude: String },
    /// `C` — DDL, concurrent: executes at each node independently,
    /// best-effort ordered, outside the 3PC pipeline (Open Question,
    /// resolved in DESIGN.md).
    DdlConcurrent { sql: String, guc_prelude: String },
    /// `E` — end-of-DDL marker.
    DdlEnd,
}

impl LogicalRecord {
    /// The single-byte type tag this record is framed with on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            LogicalRecord::ParallelSafe { .. } => b'P',
            LogicalRecord::Snapshot { .. } => b'S',
            LogicalRecord::Abort { .. } => b'A',
            LogicalRecord::LockGraph { .. } => b'L',
            LogicalRecord::SequenceNext { .. } => b'N',
            LogicalRecord::BroadcastTable { .. } => b'B',
            LogicalRecord::DdlTransactional { .. } => b'D',
            LogicalRecord::DdlConcurrent { .. } => b'C',
            LogicalRecord::DdlEnd => b'E',
        }
    }
}

/// The seam through which the core writes logical records into the
/// engine's replication log (the `LogLogicalMessage`-equivalent entry
/// point of design note §9). The engine owns framing, flushing and
/// shipping bytes to peers; the core only ever calls `log`.
pub trait LogSink {
    fn log(&mut self, record: &LogicalRecord) -> submerge_base::Result<()>;

    /// Flush-to-durable-before-reply, required at the donor gen-switch
    /// synchronization point (§4.3).
    fn flush(&mut self) -> submerge_base::Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tags_match_spec_bytes() {
        assert_eq!(
            LogicalRecord::ParallelSafe {
                gen_num: 1,
                members: NodeMask::EMPTY,
                configured: NodeMask::EMPTY,
                donors: NodeMask::EMPTY,
            }
            .tag(),
            b'P'
        );
        assert_eq!(LogicalRecord::DdlEnd.tag(), b'E');
    }
}
