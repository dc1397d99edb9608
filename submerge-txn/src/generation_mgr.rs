//! Component C: owns the only write path to persistent state, the
//! gen-switch protocol, and status-in-gen derivation (§4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use submerge_base::{err, NodeMask, Result};
use submerge_net::{Generation, LogSink, LogicalRecord, NodeID};
use tracing::info;

use crate::barrier::PrepareBarrier;
use crate::config::Config;
use crate::persist::{PersistentState, Store};
use crate::status::{GenerationEvent, ReceiveMode, StatusInGen, UserStatus};
use crate::votestate::VoteState;

struct GenState {
    current_gen: Generation,
    donors: NodeMask,
    last_online_in: u64,
    receive_mode: ReceiveMode,
}

struct VoteInner {
    last_vote: VoteState,
    tour_in_progress: bool,
}

/// A Vote Handler reply (§4.4): either an affirmative carrying this
/// node's `last_online_in` (a donor candidate signal), or a refusal
/// that optionally reveals the voter's own `last_vote.num` so the
/// asking campaigner knows it has fallen behind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VoteReply {
    pub ok: bool,
    pub last_online_in: Option<u64>,
    pub last_vote_num: Option<u64>,
}

/// What `handle_parallel_safe` tells its caller to do (§4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// The record arrived on a normal stream while we're still in
    /// RECOVERY for this generation; the caller must reconnect on the
    /// recovery stream and reapply.
    ReapplyInRecoveryMode,
}

pub struct GenerationManager<L: LogSink> {
    node_id: NodeID,
    config: Config,
    store: Store,
    log: Mutex<L>,
    gen: RwLock<GenState>,
    vote: RwLock<VoteInner>,
    gen_num_fast: AtomicU64,
    config_changes: AtomicU64,
}

impl<L: LogSink> GenerationManager<L> {
    pub fn new(node_id: NodeID, config: Config, store: Store, log: L, initial: PersistentState) -> Self {
        let gen_num_fast = AtomicU64::new(initial.current_gen.num);
        GenerationManager {
            node_id,
            config,
            store,
            log: Mutex::new(log),
            gen: RwLock::new(GenState {
                current_gen: initial.current_gen,
                donors: initial.donors,
                last_online_in: initial.last_online_in,
                receive_mode: ReceiveMode::Disabled,
            }),
            vote: RwLock::new(VoteInner {
                last_vote: initial.last_vote,
                tour_in_progress: false,
            }),
            gen_num_fast,
            config_changes: AtomicU64::new(0),
        }
    }

    /// Lock-free fast path for "am I in this generation yet?" (§4.3).
    pub fn current_gen_num(&self) -> u64 {
        self.gen_num_fast.load(Ordering::Acquire)
    }

    pub fn current_gen(&self) -> Generation {
        self.gen.read().unwrap().current_gen
    }

    pub fn donors(&self) -> NodeMask {
        self.gen.read().unwrap().donors
    }

    pub fn last_online_in(&self) -> u64 {
        self.gen.read().unwrap().last_online_in
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.gen.read().unwrap().receive_mode
    }

    pub fn last_vote(&self) -> VoteState {
        self.vote.read().unwrap().last_vote
    }

    pub fn config_change_count(&self) -> u64 {
        self.config_changes.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// ONLINE / RECOVERY / DEAD per §3.
    pub fn status_in_gen(&self) -> StatusInGen {
        let gen = self.gen.read().unwrap();
        let vote = self.vote.read().unwrap();
        self.status_in_gen_locked(&gen, &vote)
    }

    fn status_in_gen_locked(&self, gen: &GenState, vote: &VoteInner) -> StatusInGen {
        if gen.current_gen.num == 0 {
            // The sentinel generation: nothing has ever been elected,
            // so "online in it" is meaningless even though
            // `last_online_in == 0 == current_gen.num` literally holds.
            StatusInGen::Dead
        } else if gen.last_online_in == gen.current_gen.num {
            StatusInGen::Online
        } else if gen.current_gen.members.contains(self.node_id.get())
            && gen.current_gen.has_quorum()
            && vote.last_vote.gen.num == gen.current_gen.num
        {
            StatusInGen::Recovery
        } else {
            StatusInGen::Dead
        }
    }

    /// User-facing status, combining status-in-gen with clique
    /// coverage (§3). `clique` is the Connectivity Tracker's current
    /// maximum clique.
    pub fn current_status(&self, clique: NodeMask) -> UserStatus {
        let gen = self.gen.read().unwrap();
        let vote = self.vote.read().unwrap();
        match self.status_in_gen_locked(&gen, &vote) {
            StatusInGen::Dead => match gen.receive_mode {
                ReceiveMode::Recovery { .. } => UserStatus::Catchup,
                _ => UserStatus::Disabled,
            },
            StatusInGen::Recovery => UserStatus::Recovery,
            StatusInGen::Online => {
                if gen.current_gen.members.is_subset_of(&clique) {
                    UserStatus::Online
                } else {
                    UserStatus::Isolated
                }
            }
        }
    }

    /// The gen-switch protocol (§4.3), invoked under the prepare
    /// barrier's holder side and an exclusive `gen_lock`. Returns
    /// `Ok(false)` without effect if `proposed_gen.num` is not past
    /// `current_gen.num` (the idempotent re-application case, scenario
    /// 6 of §8).
    pub fn consider_gen_switch(
        &self,
        barrier: &PrepareBarrier,
        proposed_gen: Generation,
        proposed_donors: NodeMask,
    ) -> Result<bool> {
        let _holder = barrier.acquire_holder();

        let mut gen = self.gen.write().unwrap();
        if proposed_gen.num <= gen.current_gen.num {
            return Ok(false);
        }
        let mut vote = self.vote.write().unwrap();

        // Step 2: we've implicitly voted for this one by switching
        // into it.
        if vote.last_vote.gen.num < proposed_gen.num {
            vote.last_vote = VoteState { gen: proposed_gen };
        }

        // Step 3.
        gen.current_gen = proposed_gen;
        gen.donors = proposed_donors;

        let is_member = proposed_gen.members.contains(self.node_id.get());
        let never_online_here =
            !is_member || !proposed_gen.has_quorum() || vote.last_vote.gen.num > proposed_gen.num;

        if never_online_here {
            gen.receive_mode = ReceiveMode::Disabled;
            self.persist(&gen, &vote)?;
            self.emit_event(GenerationEvent::SwitchedDisabled {
                gen_num: proposed_gen.num,
            });
        } else if proposed_donors.contains(self.node_id.get()) {
            {
                let mut log = self.log.lock().unwrap();
                log.log(&LogicalRecord::ParallelSafe {
                    gen_num: proposed_gen.num,
                    members: proposed_gen.members,
                    configured: proposed_gen.configured,
                    donors: proposed_donors,
                })?;
                log.flush()?;
            }
            gen.last_online_in = proposed_gen.num;
            self.persist(&gen, &vote)?;
            gen.receive_mode = ReceiveMode::Normal;
            self.emit_event(GenerationEvent::SwitchedAsDonor {
                gen_num: proposed_gen.num,
            });
        } else {
            self.persist(&gen, &vote)?;
            let donor = NodeID(
                proposed_donors
                    .iter()
                    .next()
                    .ok_or_else(|| err("gen switch: no donors available for recovery"))?,
            );
            gen.receive_mode = ReceiveMode::Recovery { donor };
            self.emit_event(GenerationEvent::SwitchedAsRecovering {
                gen_num: proposed_gen.num,
                donor,
            });
        }

        self.gen_num_fast.store(proposed_gen.num, Ordering::Release);
        self.config_changes.fetch_add(1, Ordering::AcqRel);

        Ok(true)
    }

    /// Invoked when an applier reads a ParallelSafe record for
    /// `gen_num` (§4.3). `is_recovery_stream` is true iff the record
    /// arrived on the stream this node considers its recovery stream
    /// (not the per-origin-only stream).
    pub fn handle_parallel_safe(
        &self,
        barrier: &PrepareBarrier,
        gen_num: u64,
        members: NodeMask,
        configured: NodeMask,
        donors: NodeMask,
        is_recovery_stream: bool,
    ) -> Result<ApplyOutcome> {
        let proposed = Generation::new(gen_num, members, configured);
        self.consider_gen_switch(barrier, proposed, donors)?;

        let mut gen = self.gen.write().unwrap();
        if gen.current_gen.num != gen_num {
            // A later gen switch already passed us; this record
            // predates our current view and is moot.
            return Ok(ApplyOutcome::Applied);
        }

        match gen.receive_mode {
            ReceiveMode::Recovery { .. } => {
                if is_recovery_stream {
                    if gen.last_online_in != gen_num {
                        gen.last_online_in = gen_num;
                        gen.receive_mode = ReceiveMode::Normal;
                        let vote = self.vote.read().unwrap();
                        self.persist(&gen, &vote)?;
                        self.emit_event(GenerationEvent::BecameOnline { gen_num });
                    }
                    Ok(ApplyOutcome::Applied)
                } else {
                    Ok(ApplyOutcome::ReapplyInRecoveryMode)
                }
            }
            _ => Ok(ApplyOutcome::Applied),
        }
    }

    fn persist(&self, gen: &GenState, vote: &VoteInner) -> Result<()> {
        self.persist_fields(gen.current_gen, gen.donors, gen.last_online_in, vote.last_vote)
    }

    fn persist_fields(
        &self,
        current_gen: Generation,
        donors: NodeMask,
        last_online_in: u64,
        last_vote: VoteState,
    ) -> Result<()> {
        self.store.save(&PersistentState {
            current_gen,
            donors,
            last_online_in,
            last_vote,
        })
    }

    /// Begins a campaign tour (§4.4 step 4): casts this node's own
    /// vote for `candidates`, persists it, and marks the tour as in
    /// progress. Returns the `Generation` the candidate vote covers,
    /// which the caller sends as `VoteRequest{gen}` to the clique.
    pub fn begin_vote_tour(&self, candidates: NodeMask) -> Result<Generation> {
        let gen = self.gen.read().unwrap();
        let mut vote = self.vote.write().unwrap();
        let proposed = Generation::new(vote.last_vote.gen.num + 1, candidates, self.config.configured);
        vote.last_vote = VoteState { gen: proposed };
        vote.tour_in_progress = true;
        self.persist_fields(gen.current_gen, gen.donors, gen.last_online_in, vote.last_vote)?;
        Ok(proposed)
    }

    pub fn tour_in_progress(&self) -> bool {
        self.vote.read().unwrap().tour_in_progress
    }

    pub fn clear_tour(&self) {
        self.vote.write().unwrap().tour_in_progress = false;
    }

    /// §4.4 step 8: if a vote reply revealed the voter has moved past
    /// us (`last_vote_num > last_vote.gen.num`), bump our own
    /// `last_vote` to that bare number with empty members/configured —
    /// we haven't actually proposed anything at that number, we're just
    /// recording that we must not vote yes for anything below it.
    pub fn bump_last_vote_num(&self, last_vote_num: u64) -> Result<()> {
        let gen = self.gen.read().unwrap();
        let mut vote = self.vote.write().unwrap();
        if last_vote_num > vote.last_vote.gen.num {
            vote.last_vote = VoteState {
                gen: Generation::new(last_vote_num, NodeMask::EMPTY, NodeMask::EMPTY),
            };
            self.persist_fields(gen.current_gen, gen.donors, gen.last_online_in, vote.last_vote)?;
        }
        Ok(())
    }

    /// The Vote Handler (§4.4), run under shared `gen_lock` + exclusive
    /// `vote_lock` for an incoming `VoteRequest{gen: proposed}` from
    /// `sender`. `clique` is this node's current maximum clique, used
    /// for the `proposed.members ⊆ my_clique` sanity check.
    pub fn handle_vote_request(&self, proposed: Generation, sender: NodeID, clique: NodeMask) -> Result<VoteReply> {
        let gen = self.gen.read().unwrap();
        let mut vote = self.vote.write().unwrap();

        if vote.last_vote.gen == proposed {
            return Ok(VoteReply {
                ok: true,
                last_online_in: Some(gen.last_online_in),
                last_vote_num: None,
            });
        }
        if vote.last_vote.gen.num >= proposed.num {
            return Ok(VoteReply {
                ok: false,
                last_online_in: None,
                last_vote_num: Some(vote.last_vote.gen.num),
            });
        }

        let proposer_adds_only_self = proposed
            .members
            .subtract(&gen.current_gen.members)
            .is_subset_of(&NodeMask::single(sender.get()));
        let within_clique = proposed.members.is_subset_of(&clique);
        let configured_matches = proposed.configured == self.config.configured;

        if proposer_adds_only_self && within_clique && configured_matches {
            vote.last_vote = VoteState { gen: proposed };
            self.persist_fields(gen.current_gen, gen.donors, gen.last_online_in, vote.last_vote)?;
            Ok(VoteReply {
                ok: true,
                last_online_in: Some(gen.last_online_in),
                last_vote_num: None,
            })
        } else {
            Ok(VoteReply {
                ok: false,
                last_online_in: None,
                last_vote_num: None,
            })
        }
    }

    fn emit_event(&self, event: GenerationEvent) {
        info!(node = self.node_id.get(), ?event, "generation manager transition");
    }
}
