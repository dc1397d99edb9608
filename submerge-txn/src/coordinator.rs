//! Component F: the per-backend three-phase-commit state machine on
//! the originating node (§4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use submerge_base::{NodeMask, Result};
use submerge_net::{BallotTerm, BusMsg, Duration, Generation, Gid, LogSink, Msg, NodeID, TxRequestKind};
use tracing::debug;

use crate::generation_mgr::GenerationManager;
use crate::status::StatusInGen;

/// Named failure kinds a coordinator reports back to its backend
/// (§7): "an infrastructure error happened" isn't enough here, the
/// caller needs to decide whether retrying makes sense.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortReason {
    NodeNotOnline,
    GenerationChanged,
    PrepareTimeout,
    RemoteAbort,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrepareOutcome {
    Committed,
    Aborted(AbortReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    InProgress,
    Prepared,
    PreCommitted,
    Committed,
    Aborted,
}

/// Per-transaction state tracked by the coordinator, mirroring §4.6's
/// state sketch exactly.
struct TxnState {
    status: Phase,
    gen_num_at_prepare: u64,
    participants: NodeMask,
    voted: NodeMask,
    proposal: BallotTerm,
    accepted: BallotTerm,
}

/// One originated transaction, from `BEGIN` through commit/abort. A
/// coordinator hands one of these out per local backend transaction;
/// it is not `Send` across backends, matching the "per-backend" share
/// of responsibility in §2.
///
/// The caller is responsible for holding the preparer side of the
/// `PrepareBarrier` (`PrepareBarrier::acquire_preparer`) for the whole
/// lifetime of this coordinator, from `BEGIN` until it has committed
/// or aborted — that guard's lifetime is tied to the backend's own
/// transaction scope, not to this struct.
pub struct TransactionCoordinator<L: LogSink, B: submerge_net::Bus> {
    me: NodeID,
    gid: Gid,
    gen_mgr: Arc<GenerationManager<L>>,
    bus: Arc<B>,
    sequence: AtomicU64,
    state: TxnState,
}

impl<L: LogSink, B: submerge_net::Bus> TransactionCoordinator<L, B> {
    /// §4.6 step 1 (Begin): snapshot nothing yet — the real snapshot
    /// of `current_gen_num`/`participants` happens in `pre_prepare`,
    /// once the backend is ready to actually prepare.
    fn new(me: NodeID, gid: Gid, gen_mgr: Arc<GenerationManager<L>>, bus: Arc<B>) -> Self {
        TransactionCoordinator {
            me,
            gid,
            gen_mgr,
            bus,
            sequence: AtomicU64::new(0),
            state: TxnState {
                status: Phase::InProgress,
                gen_num_at_prepare: 0,
                participants: NodeMask::EMPTY,
                voted: NodeMask::EMPTY,
                proposal: BallotTerm::zero(),
                accepted: BallotTerm::zero(),
            },
        }
    }

    pub fn gid(&self) -> &Gid {
        &self.gid
    }

    /// §4.6 step 2 (PrePrepare): refuses with `NodeNotOnline` unless
    /// this node is currently ONLINE in its generation. On success,
    /// fixes `participants` and `gen_num_at_prepare` for the remainder
    /// of this transaction's life.
    pub fn pre_prepare(&mut self) -> std::result::Result<(), AbortReason> {
        if self.gen_mgr.status_in_gen() != StatusInGen::Online {
            return Err(AbortReason::NodeNotOnline);
        }
        let gen = self.gen_mgr.current_gen();
        self.state.gen_num_at_prepare = gen.num;
        self.state.participants = gen.members.subtract(&NodeMask::single(self.me.get()));
        self.state.status = Phase::InProgress;
        Ok(())
    }

    /// True once the fixed `participants`/`gen_num_at_prepare` pair no
    /// longer matches the live generation — any in-flight wait must
    /// abort (§4.6 "tie-breaks and edge cases").
    fn gen_invalidated(&self) -> bool {
        let gen = self.gen_mgr.current_gen();
        gen.num != self.state.gen_num_at_prepare
            || gen.members != self.state.participants.union(&NodeMask::single(self.me.get()))
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) as i64
    }

    fn broadcast(&self, kind: TxRequestKind) -> Result<()> {
        for peer in self.state.participants.iter() {
            self.bus.send(Msg::request(
                self.me,
                NodeID(peer),
                self.next_sequence(),
                BusMsg::TxRequest {
                    gid: self.gid.as_str().to_string(),
                    kind,
                    term: self.state.proposal,
                },
            ))?;
        }
        Ok(())
    }

    /// §4.6 step 2's tail: writes the local PREPARE (the engine's WAL
    /// does the actual write; this call only sends the replicated
    /// prepare's out-of-band announcement to participants so they know
    /// to expect it on the replication stream) and moves to waiting for
    /// quorum acks.
    pub fn post_prepare_begin(&mut self) -> Result<()> {
        self.state.voted = NodeMask::EMPTY;
        self.broadcast(TxRequestKind::Status)
    }

    /// Folds one participant's `PREPARED`/`ABORTED` reply (arriving
    /// as a `TwoAResponse` over the bus) into the quorum tally for the
    /// phase currently being waited on.
    pub fn on_ack(&mut self, from: NodeID, status: submerge_net::TxStatus) -> std::result::Result<(), AbortReason> {
        use submerge_net::TxStatus::*;
        if self.gen_invalidated() {
            return Err(AbortReason::GenerationChanged);
        }
        match (self.state.status, status) {
            (Phase::InProgress, Prepared) => {
                self.state.voted.set(from.get(), true);
                Ok(())
            }
            (Phase::PreCommitted | Phase::InProgress, PreCommitted) => {
                self.state.voted.set(from.get(), true);
                Ok(())
            }
            (_, Aborted | PreAborted) => Err(AbortReason::RemoteAbort),
            _ => Ok(()),
        }
    }

    fn quorum_reached(&self) -> bool {
        self.state.participants.is_subset_of(&self.state.voted)
    }

    /// §4.6 step 3: the coordinator's deadline, `max(min_2pc_timeout,
    /// prepare_wall_time * ratio / 100)`.
    pub fn deadline(&self, prepare_wall_time: Duration) -> Duration {
        let config = self.gen_mgr.config();
        let scaled = Duration(prepare_wall_time.0 * config.max_2pc_ratio as i64 / 100);
        if scaled.0 > config.min_2pc_timeout.0 {
            scaled
        } else {
            config.min_2pc_timeout
        }
    }

    /// §4.6 step 3-4: called by the wait loop once either quorum is
    /// reached, a participant aborted, the deadline passed, or the
    /// generation changed underneath the transaction. Drives the
    /// PREPARE -> PRECOMMIT transition, or decides the final outcome.
    pub fn advance(&mut self, timed_out: bool) -> Result<Option<PrepareOutcome>> {
        if self.gen_invalidated() {
            self.state.status = Phase::Aborted;
            return Ok(Some(PrepareOutcome::Aborted(AbortReason::GenerationChanged)));
        }
        if timed_out && !self.quorum_reached() {
            self.state.status = Phase::Aborted;
            return Ok(Some(PrepareOutcome::Aborted(AbortReason::PrepareTimeout)));
        }
        if !self.quorum_reached() {
            return Ok(None);
        }

        match self.state.status {
            Phase::InProgress => {
                self.state.status = Phase::Prepared;
                self.state.voted = NodeMask::EMPTY;
                self.broadcast(TxRequestKind::Precommit)?;
                self.state.status = Phase::PreCommitted;
                debug!(gid = %self.gid, "prepare quorum reached, precommitting");
                Ok(None)
            }
            Phase::PreCommitted => {
                self.state.status = Phase::Committed;
                self.broadcast(TxRequestKind::Commit)?;
                debug!(gid = %self.gid, "precommit quorum reached, committing");
                Ok(Some(PrepareOutcome::Committed))
            }
            _ => Ok(None),
        }
    }

    /// Aborts out-of-band (e.g. the backend itself chose to roll
    /// back); idempotent.
    pub fn abort(&mut self) -> Result<()> {
        if self.state.status == Phase::Committed || self.state.status == Phase::Aborted {
            return Ok(());
        }
        self.state.status = Phase::Aborted;
        self.broadcast(TxRequestKind::Abort)
    }
}

/// Builds a fresh gid and coordinator for a new local transaction. The
/// caller must already hold `barrier.acquire_preparer()` before
/// calling this and for as long as the returned coordinator lives.
pub fn begin<L: LogSink, B: submerge_net::Bus>(
    me: NodeID,
    coordinator_pid: u32,
    counter: u64,
    gen_mgr: Arc<GenerationManager<L>>,
    bus: Arc<B>,
) -> TransactionCoordinator<L, B> {
    let gid = Gid::new(me, coordinator_pid, counter);
    TransactionCoordinator::new(me, gid, gen_mgr, bus)
}
