//! Component G: applies replicated prepares on a non-originating node
//! and answers status polls and precommit/abort orders (§4.7).

use std::collections::HashMap;
use std::sync::Mutex;

use submerge_base::{NodeMask, Result};
use submerge_net::{BallotTerm, Gid, NodeID, TxStatus};

use crate::generation_mgr::GenerationManager;
use crate::status::StatusInGen;

/// What a participant tells its caller to do with a locally prepared
/// transaction (§4.7). `PrepareOutcome` in `coordinator.rs` is the
/// coordinator's view of the *whole* transaction; this is one
/// participant's view of its own local slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParticipantOutcome {
    Prepared,
    Refused,
}

struct Slot {
    status: TxStatus,
    origin: NodeID,
    /// The ballot terms the resolver (§4.8) keeps promised/accepted
    /// against this slot. Lives here, not in the resolver, because
    /// both need it under the same entry and the participant outlives
    /// any one resolver round.
    promised: BallotTerm,
    accepted: BallotTerm,
    accepted_value: Option<TxStatus>,
}

/// Owns the set of locally prepared-but-not-yet-finished transactions
/// this node is participating in as a non-coordinator. One instance
/// per node; entries are indexed by `gid`.
pub struct TransactionParticipant<L: submerge_net::LogSink> {
    me: NodeID,
    gen_mgr: std::sync::Arc<GenerationManager<L>>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<L: submerge_net::LogSink> TransactionParticipant<L> {
    pub fn new(me: NodeID, gen_mgr: std::sync::Arc<GenerationManager<L>>) -> Self {
        TransactionParticipant {
            me,
            gen_mgr,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// On receiving a PREPARE record (§4.7): prepares locally and
    /// replies `Prepared` when this node is ONLINE in the record's
    /// generation, or when the record arrived on this node's recovery
    /// stream; otherwise refuses without entering the slot.
    /// `gen_num_in_record` is the generation the prepare was logged
    /// under; `is_recovery_stream` mirrors the flag the Generation
    /// Manager's `handle_parallel_safe` already takes.
    pub fn on_prepare(
        &self,
        gid: &Gid,
        origin: NodeID,
        gen_num_in_record: u64,
        is_recovery_stream: bool,
    ) -> ParticipantOutcome {
        let current_gen_num = self.gen_mgr.current_gen_num();
        let online = self.gen_mgr.status_in_gen() == StatusInGen::Online;
        if current_gen_num != gen_num_in_record || !(online || is_recovery_stream) {
            return ParticipantOutcome::Refused;
        }

        let mut slots = self.slots.lock().unwrap();
        slots.insert(
            gid.as_str().to_string(),
            Slot {
                status: TxStatus::Prepared,
                origin,
                promised: BallotTerm::zero(),
                accepted: BallotTerm::zero(),
                accepted_value: None,
            },
        );
        ParticipantOutcome::Prepared
    }

    /// On receiving a PRECOMMIT logical message: advances the slot to
    /// `PreCommitted`. No-op if the slot isn't known (already resolved
    /// or never prepared here).
    pub fn on_precommit(&self, gid: &Gid) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(gid.as_str()) {
            slot.status = TxStatus::PreCommitted;
        }
    }

    /// On receiving COMMIT: idempotent, removes the slot.
    pub fn on_commit(&self, gid: &Gid) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(gid.as_str()) {
            slot.status = TxStatus::Committed;
        }
        slots.remove(gid.as_str());
    }

    /// On receiving ABORT: idempotent, removes the slot.
    pub fn on_abort(&self, gid: &Gid) {
        self.slots.lock().unwrap().remove(gid.as_str());
    }

    /// Reply to a status poll (§4.8's Phase 1): the slot's status and
    /// the ballot already promised, or `Unknown`/zero ballot if this
    /// node never prepared (or already resolved) `gid`.
    pub fn status_poll(&self, gid: &Gid) -> (TxStatus, BallotTerm) {
        let slots = self.slots.lock().unwrap();
        match slots.get(gid.as_str()) {
            Some(slot) => (slot.status, slot.promised),
            None => (TxStatus::Unknown, BallotTerm::zero()),
        }
    }

    /// Every `gid` currently prepared here whose origin is not in
    /// `current_gen.members` — the orphan set the Resolver (§4.8 step
    /// 1) must pick up once a generation switch excludes a coordinator.
    pub fn orphans(&self, current_members: NodeMask) -> Vec<String> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, slot)| !current_members.contains(slot.origin.get()))
            .map(|(gid, _)| gid.clone())
            .collect()
    }

    /// Resolver Phase 1 (§4.8 step 3): promise `proposal` if it beats
    /// the slot's current promise, returning `(accepted, accepted_value)`
    /// on success or `None` on refusal.
    pub fn promise(&self, gid: &Gid, proposal: BallotTerm) -> Option<(BallotTerm, Option<TxStatus>)> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(gid.as_str())?;
        if proposal > slot.promised {
            slot.promised = proposal;
            Some((slot.accepted, slot.accepted_value))
        } else {
            None
        }
    }

    /// Resolver Phase 2 (§4.8 step 4): accept `value` under `proposal`
    /// if it's still at least as high as the promise.
    pub fn accept(&self, gid: &Gid, proposal: BallotTerm, value: TxStatus) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(gid.as_str()) else {
            return false;
        };
        if proposal >= slot.promised {
            slot.promised = proposal;
            slot.accepted = proposal;
            slot.accepted_value = Some(value);
            true
        } else {
            false
        }
    }

    pub fn me(&self) -> NodeID {
        self.me
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::barrier::PrepareBarrier;
    use crate::config::Config;
    use crate::persist::{PersistentState, Store};
    use submerge_net::{Generation, LogicalRecord};
    use test_log::test;

    struct FakeLog;
    impl submerge_net::LogSink for FakeLog {
        fn log(&mut self, _record: &LogicalRecord) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn online_participant(me: u8, members: NodeMask) -> TransactionParticipant<FakeLog> {
        let mut p = std::env::temp_dir();
        p.push(format!("submerge-txn-part-{me}-{:?}", std::time::SystemTime::now()));
        std::fs::create_dir_all(&p).unwrap();
        let gen_mgr = std::sync::Arc::new(GenerationManager::new(
            NodeID(me),
            Config::new(NodeID(me), members),
            Store::new(p.join("state")),
            FakeLog,
            PersistentState::initial(),
        ));
        let barrier = PrepareBarrier::new();
        gen_mgr
            .consider_gen_switch(&barrier, Generation::new(1, members, members), members)
            .unwrap();
        TransactionParticipant::new(NodeID(me), gen_mgr)
    }

    #[test]
    fn prepare_accepted_when_online_in_current_gen() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        let outcome = p.on_prepare(&gid, NodeID(1), 1, false);
        assert_eq!(outcome, ParticipantOutcome::Prepared);
        assert_eq!(p.status_poll(&gid).0, TxStatus::Prepared);
    }

    #[test]
    fn prepare_refused_for_stale_generation() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        let outcome = p.on_prepare(&gid, NodeID(1), 99, false);
        assert_eq!(outcome, ParticipantOutcome::Refused);
        assert_eq!(p.status_poll(&gid).0, TxStatus::Unknown);
    }

    #[test]
    fn precommit_then_commit_lifecycle() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        p.on_prepare(&gid, NodeID(1), 1, false);
        p.on_precommit(&gid);
        assert_eq!(p.status_poll(&gid).0, TxStatus::PreCommitted);
        p.on_commit(&gid);
        assert_eq!(p.status_poll(&gid).0, TxStatus::Unknown);
    }

    #[test]
    fn abort_is_idempotent() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        p.on_prepare(&gid, NodeID(1), 1, false);
        p.on_abort(&gid);
        p.on_abort(&gid);
        assert_eq!(p.status_poll(&gid).0, TxStatus::Unknown);
    }

    #[test]
    fn orphans_reported_when_origin_leaves_membership() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        p.on_prepare(&gid, NodeID(1), 1, false);
        let orphans = p.orphans(NodeMask::from_ids([2, 3]));
        assert_eq!(orphans, vec![gid.as_str().to_string()]);
    }

    #[test]
    fn promise_rejects_non_increasing_proposal() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        p.on_prepare(&gid, NodeID(1), 1, false);
        let b1 = BallotTerm { counter: 1, proposer: Some(NodeID(2)) };
        assert!(p.promise(&gid, b1).is_some());
        assert!(p.promise(&gid, b1).is_none());
        let b2 = BallotTerm { counter: 2, proposer: Some(NodeID(3)) };
        assert!(p.promise(&gid, b2).is_some());
    }

    #[test]
    fn accept_records_value_and_promise_reflects_it() {
        let p = online_participant(2, NodeMask::from_ids([1, 2, 3]));
        let gid = Gid::new(NodeID(1), 1, 1);
        p.on_prepare(&gid, NodeID(1), 1, false);
        let b1 = BallotTerm { counter: 1, proposer: Some(NodeID(2)) };
        assert!(p.accept(&gid, b1, TxStatus::PreCommitted));
        let (accepted, value) = p.promise(&gid, BallotTerm { counter: 2, proposer: Some(NodeID(3)) }).unwrap();
        assert_eq!(accepted, b1);
        assert_eq!(value, Some(TxStatus::PreCommitted));
    }
}
