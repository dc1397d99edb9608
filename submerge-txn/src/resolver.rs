//! Component H: single-decree Paxos resolution of prepared
//! transactions whose coordinator died mid-commit (§4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use submerge_base::{NodeMask, Result};
use submerge_net::{BallotTerm, Bus, BusMsg, Gid, LogSink, LogicalRecord, Msg, NodeID, TxRequestKind, TxStatus};

use crate::participant::TransactionParticipant;
use crate::persist::RoundStore;

/// The two values a resolver round can settle on for an orphaned
/// transaction — §4.8 only ever resolves prepared-or-precommitted
/// transactions to one of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolvedValue {
    PreCommit,
    PreAbort,
}

impl From<ResolvedValue> for TxStatus {
    fn from(v: ResolvedValue) -> TxStatus {
        match v {
            ResolvedValue::PreCommit => TxStatus::PreCommitted,
            ResolvedValue::PreAbort => TxStatus::PreAborted,
        }
    }
}

/// One promise reply gathered during Phase 1 (§4.8 step 3).
pub struct PromiseReply {
    pub from: NodeID,
    pub accepted: BallotTerm,
    pub accepted_value: Option<TxStatus>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct Round {
    proposal: BallotTerm,
    max_seen: u64,
}

/// Accumulates replies to one in-flight Phase-1 round (§4.8 step 3).
/// A promise reply is the only signal a participant sends back: a
/// refusal is silence, since `TxStatusResponse` has no error field to
/// carry it, so every reply folded in here already counts toward
/// quorum.
pub struct Phase1State {
    gid: String,
    proposal: BallotTerm,
    target: NodeMask,
    replied: NodeMask,
    replies: Vec<PromiseReply>,
}

impl Phase1State {
    pub fn has_quorum(&self, members_count: u32) -> bool {
        NodeMask::is_majority_of(self.replied.count(), members_count)
    }

    pub fn is_done(&self) -> bool {
        self.replied == self.target
    }
}

/// Accumulates replies to one in-flight Phase-2 round (§4.8 step 4).
/// Unlike Phase 1, a refusal here is explicit (`TwoAResponse.err_code`
/// is non-zero), so only accepts are folded in.
pub struct Phase2State {
    gid: String,
    proposal: BallotTerm,
    value: ResolvedValue,
    target: NodeMask,
    accepted: NodeMask,
}

impl Phase2State {
    pub fn has_quorum(&self, members_count: u32) -> bool {
        NodeMask::is_majority_of(self.accepted.count(), members_count)
    }
}

/// Drives orphan `gid`s through Phase 1 (prepare) and Phase 2 (accept)
/// of single-decree Paxos, persists the ballot state it proposes so a
/// restart doesn't forget its own promise, and finalizes+broadcasts
/// the decision once a round reaches quorum. One `Resolver` instance
/// is shared across all orphans this node is currently resolving;
/// per-gid state lives in `rounds`.
pub struct Resolver<L: LogSink, B: Bus> {
    me: NodeID,
    log: Mutex<L>,
    bus: Arc<B>,
    store: RoundStore,
    rounds: Mutex<HashMap<String, Round>>,
    ballot_counter: AtomicU64,
}

impl<L: LogSink, B: Bus> Resolver<L, B> {
    pub fn new(me: NodeID, log: L, bus: Arc<B>, store: RoundStore) -> Self {
        let rounds = store.load().unwrap_or_default();
        Resolver {
            me,
            log: Mutex::new(log),
            bus,
            store,
            rounds: Mutex::new(rounds),
            ballot_counter: AtomicU64::new(0),
        }
    }

    /// §4.8 step 1: the orphan `gid`s this node's `TransactionParticipant`
    /// is holding whose origin coordinator has left `current_members` —
    /// what a caller should feed into `start_phase1` for each entry.
    pub fn discover_orphans(&self, participant: &TransactionParticipant<impl LogSink>, current_members: NodeMask) -> Vec<String> {
        participant.orphans(current_members)
    }

    fn persist_rounds(&self) -> Result<()> {
        self.store.save(&*self.rounds.lock().unwrap())
    }

    /// §4.8 step 3: starts (or restarts, after a refusal) a Phase-1
    /// round for `gid`, returning the proposed ballot.
    fn begin_round(&self, gid: &str) -> Result<BallotTerm> {
        let proposal = {
            let mut rounds = self.rounds.lock().unwrap();
            let round = rounds.entry(gid.to_string()).or_insert(Round {
                proposal: BallotTerm::zero(),
                max_seen: 0,
            });
            let counter = self.ballot_counter.fetch_add(1, Ordering::Relaxed) + round.max_seen + 1;
            round.proposal = BallotTerm {
                counter,
                proposer: Some(self.me),
            };
            round.proposal
        };
        self.persist_rounds()?;
        Ok(proposal)
    }

    /// If a refusal reveals a higher ballot has been promised
    /// elsewhere, record it so the next `begin_round` proposes above
    /// it.
    pub fn note_refusal(&self, gid: &str, seen: BallotTerm) -> Result<()> {
        {
            let mut rounds = self.rounds.lock().unwrap();
            if let Some(round) = rounds.get_mut(gid) {
                round.max_seen = round.max_seen.max(seen.counter);
            }
        }
        self.persist_rounds()
    }

    /// §4.8 step 3: broadcasts `Prepare(gid, proposal)` (a
    /// `TxRequest{kind: Status}` carrying the proposal as its `term`)
    /// to `members \ {me}` and returns the tally to fold replies into.
    pub fn start_phase1(&self, gid: &str, members: NodeMask) -> Result<Phase1State> {
        let proposal = self.begin_round(gid)?;
        let target = members.subtract(&NodeMask::single(self.me.get()));
        for peer in target.iter() {
            self.bus.send(Msg::request(
                self.me,
                NodeID(peer),
                0,
                BusMsg::TxRequest {
                    gid: gid.to_string(),
                    kind: TxRequestKind::Status,
                    term: proposal,
                },
            ))?;
        }
        Ok(Phase1State {
            gid: gid.to_string(),
            proposal,
            target,
            replied: NodeMask::EMPTY,
            replies: Vec::new(),
        })
    }

    /// Folds one `TxStatusResponse` into `state`.
    pub fn on_phase1_reply(&self, state: &mut Phase1State, from: NodeID, resp: &BusMsg) {
        if let BusMsg::TxStatusResponse { gid, status, accepted, .. } = resp {
            if *gid != state.gid {
                return;
            }
            state.replied.set(from.get(), true);
            state.replies.push(PromiseReply {
                from,
                accepted: *accepted,
                accepted_value: if *status == TxStatus::Unknown { None } else { Some(*status) },
            });
        }
    }

    /// Participant-side reply to an incoming Phase-1 `Prepare(gid,
    /// proposal)` (§4.8 step 3). Promises `term` against the slot for
    /// `gid` and replies with whatever it had already accepted;
    /// returns `None` (no reply at all) on refusal.
    pub fn handle_phase1_request(&self, req: &Msg, participant: &TransactionParticipant<impl LogSink>) -> Option<Msg> {
        let (gid, term) = match &req.body {
            BusMsg::TxRequest {
                gid,
                kind: TxRequestKind::Status,
                term,
            } => (gid.clone(), *term),
            _ => return None,
        };
        let gid = Gid::from_wire(gid);
        let (accepted, accepted_value) = participant.promise(&gid, term)?;
        Some(Msg::response(
            self.me,
            req.src,
            req.sequence,
            BusMsg::TxStatusResponse {
                gid: gid.as_str().to_string(),
                status: accepted_value.unwrap_or(TxStatus::Unknown),
                proposal: term,
                accepted,
            },
        ))
    }

    /// §4.8 step 4: folds a quorum of Phase-1 promise replies into the
    /// value to propose in Phase 2. If no reply carries a prior
    /// accepted value, falls back to the orphan's locally-observed
    /// statuses: PreAbort unless some participant already reports
    /// PreCommitted.
    pub fn pick_value(&self, replies: &[PromiseReply], any_precommitted_locally: bool) -> ResolvedValue {
        let highest = replies
            .iter()
            .filter_map(|r| r.accepted_value.map(|v| (r.accepted, v)))
            .max_by_key(|(accepted, _)| *accepted);

        match highest {
            Some((_, TxStatus::PreCommitted)) | Some((_, TxStatus::Committed)) => ResolvedValue::PreCommit,
            Some((_, _)) => ResolvedValue::PreAbort,
            None if any_precommitted_locally => ResolvedValue::PreCommit,
            None => ResolvedValue::PreAbort,
        }
    }

    /// §4.8 step 4: folds `state`'s gathered promises into a value and
    /// broadcasts `Accept(gid, proposal, value)` to `members \ {me}`.
    pub fn start_phase2(&self, state: Phase1State, any_precommitted_locally: bool, members: NodeMask) -> Result<Phase2State> {
        let value = self.pick_value(&state.replies, any_precommitted_locally);
        let kind = match value {
            ResolvedValue::PreCommit => TxRequestKind::Precommit,
            ResolvedValue::PreAbort => TxRequestKind::Preabort,
        };
        let target = members.subtract(&NodeMask::single(self.me.get()));
        for peer in target.iter() {
            self.bus.send(Msg::request(
                self.me,
                NodeID(peer),
                0,
                BusMsg::TxRequest {
                    gid: state.gid.clone(),
                    kind,
                    term: state.proposal,
                },
            ))?;
        }
        Ok(Phase2State {
            gid: state.gid,
            proposal: state.proposal,
            value,
            target,
            accepted: NodeMask::EMPTY,
        })
    }

    /// Folds one `TwoAResponse` into `state`.
    pub fn on_phase2_reply(&self, state: &mut Phase2State, from: NodeID, resp: &BusMsg) {
        if let BusMsg::TwoAResponse { gid, err_code, .. } = resp {
            if *gid == state.gid && *err_code == 0 {
                state.accepted.set(from.get(), true);
            }
        }
    }

    /// Participant-side reply to an incoming Phase-2 `Accept(gid,
    /// proposal, value)` (§4.8 step 4).
    pub fn handle_phase2_request(&self, req: &Msg, participant: &TransactionParticipant<impl LogSink>) -> Option<Msg> {
        let (gid, value, term) = match &req.body {
            BusMsg::TxRequest {
                gid,
                kind: TxRequestKind::Precommit,
                term,
            } => (gid.clone(), TxStatus::PreCommitted, *term),
            BusMsg::TxRequest {
                gid,
                kind: TxRequestKind::Preabort,
                term,
            } => (gid.clone(), TxStatus::PreAborted, *term),
            _ => return None,
        };
        let gid = Gid::from_wire(gid);
        let accepted_ok = participant.accept(&gid, term, value);
        Some(Msg::response(
            self.me,
            req.src,
            req.sequence,
            BusMsg::TwoAResponse {
                gid: gid.as_str().to_string(),
                status: value,
                accepted: term,
                err_code: if accepted_ok { 0 } else { 1 },
                err_msg: if accepted_ok { String::new() } else { "stale ballot".to_string() },
            },
        ))
    }

    /// §4.8 step 5: once `state` has a quorum of accepts, finalizes the
    /// orphan locally and broadcasts the decision. Only the abort
    /// outcome gets a logged record (`LogicalRecord::Abort`); there is
    /// no wire record for a plain commit, mirroring how the
    /// coordinator's own commit step is an engine call rather than a
    /// logged one. Drops the persisted ballot either way, since the
    /// round is now settled. Returns `false` without side effects if
    /// `state` hasn't reached quorum yet.
    pub fn finalize(&self, state: Phase2State, members: NodeMask, participant: &TransactionParticipant<impl LogSink>) -> Result<bool> {
        if !state.has_quorum(members.count()) {
            return Ok(false);
        }
        let gid = Gid::from_wire(state.gid.clone());
        let kind = match state.value {
            ResolvedValue::PreCommit => {
                participant.on_commit(&gid);
                TxRequestKind::Commit
            }
            ResolvedValue::PreAbort => {
                self.log.lock().unwrap().log(&LogicalRecord::Abort {
                    gid: state.gid.clone(),
                    origin_node: self.me,
                    origin_lsn: 0,
                })?;
                participant.on_abort(&gid);
                TxRequestKind::Abort
            }
        };
        for peer in state.target.iter() {
            self.bus.send(Msg::request(
                self.me,
                NodeID(peer),
                0,
                BusMsg::TxRequest {
                    gid: state.gid.clone(),
                    kind,
                    term: state.proposal,
                },
            ))?;
        }
        self.clear_round(&state.gid)?;
        Ok(true)
    }

    pub fn clear_round(&self, gid: &str) -> Result<()> {
        {
            let mut rounds = self.rounds.lock().unwrap();
            rounds.remove(gid);
        }
        self.persist_rounds()
    }

    pub fn proposal_for(&self, gid: &str) -> Option<BallotTerm> {
        self.rounds.lock().unwrap().get(gid).map(|r| r.proposal)
    }
}
