use crate::{generation::BallotTerm, Generation, NodeID};
use serde::{Deserialize, Serialize};
use submerge_base::NodeMask;

/// Distributed transaction status as carried on the wire. A superset of
/// the coordinator-local `State` enum: remote parties only ever see
/// these, never the coordinator's internal wait-state bookkeeping.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    InProgress,
    Prepared,
    PreCommitted,
    PreAborted,
    Committed,
    Aborted,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TxRequestKind {
    Status,
    Abort,
    Commit,
    Precommit,
    Preabort,
}

/// One wait-for edge as gossiped over the bus (§4.9): `waiter` blocks
/// on `holder`, where either side may live on a different node than
/// the other.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter_node: NodeID,
    pub waiter_xid: u32,
    pub holder_node: NodeID,
    pub holder_xid: u32,
}

/// Variable-length, tagged bus messages (§6). These travel over the
/// auxiliary reliable message bus, not the replication stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BusMsg {
    Heartbeat {
        sender_connected_mask: NodeMask,
        sender_current_gen: Generation,
        sender_donors: NodeMask,
        sender_last_online_in: u64,
    },
    VoteRequest {
        gen: Generation,
    },
    VoteResponse {
        gen_num: u64,
        ok: bool,
        last_online_in: Option<u64>,
        last_vote_num: Option<u64>,
    },
    TxRequest {
        gid: String,
        kind: TxRequestKind,
        term: BallotTerm,
    },
    TxStatusResponse {
        gid: String,
        status: TxStatus,
        proposal: BallotTerm,
        accepted: BallotTerm,
    },
    TwoAResponse {
        gid: String,
        status: TxStatus,
        accepted: BallotTerm,
        err_code: i32,
        err_msg: String,
    },
    LastTermRequest,
    LastTermResponse {
        term: BallotTerm,
    },
    /// A node's own portion of the cross-node wait-for graph (§4.9),
    /// pushed to every peer on the same cadence it's logged locally.
    LockGraph {
        edges: Vec<WaitEdge>,
    },
}

/// The common envelope every bus message travels in, mirroring the
/// `src`/`dst`/`sequence`/`response` framing the replication transport
/// already uses for request/response pairing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub src: NodeID,
    pub dst: NodeID,
    pub sequence: i64,
    pub response: bool,
    pub body: BusMsg,
}

impl Msg {
    pub fn request(src: NodeID, dst: NodeID, sequence: i64, body: BusMsg) -> Self {
        Msg {
            src,
            dst,
            sequence,
            response: false,
            body,
        }
    }

    pub fn response(src: NodeID, dst: NodeID, sequence: i64, body: BusMsg) -> Self {
        Msg {
            src,
            dst,
            sequence,
            response: true,
            body,
        }
    }
}
