//! Components D/E: the Campaigner decides when to propose a new
//! generation and runs the one-round vote; the Vote Handler answers
//! incoming proposals from other nodes' campaigners (§4.4).

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use submerge_base::{NodeMask, Result};
use submerge_net::{BusMsg, Duration, Generation, LogSink, Msg, NodeID, NodeTime};
use tracing::debug;

use crate::barrier::PrepareBarrier;
use crate::config::Config;
use crate::connectivity::ConnectivityTracker;
use crate::generation_mgr::GenerationManager;
use crate::notify::Notifier;
use crate::status::StatusInGen;

/// What one campaign decision (§4.4 step 3) results in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CampaignDecision {
    /// Nothing to do this tick.
    Skip,
    /// No majority is visible; give up and mark this node DISABLED.
    SetDisabled,
    /// Not yet a member, but connectivity suggests a specific donor to
    /// recover from; a purely receive-side hint, no vote cast.
    SetCatchupHint(NodeID),
    /// Propose `members` as the next generation's membership.
    Propose(NodeMask),
}

/// Accumulates replies to one in-flight `VoteRequest` round (§4.4 steps
/// 5-6). The embedding message loop owns the lifetime of this value:
/// create it from `Campaigner::start_tour`, feed it replies via
/// `Campaigner::on_vote_response` as they arrive, and call
/// `Campaigner::finish_tour` once `is_done` reports true or a deadline
/// passes.
#[derive(Clone, Debug)]
pub struct TourState {
    pub gen: Generation,
    target: NodeMask,
    replied: NodeMask,
    ok_votes: NodeMask,
    max_last_online_in: u64,
    donors: NodeMask,
    max_last_vote_num: u64,
}

impl TourState {
    pub fn is_done(&self, configured_count: u32) -> bool {
        NodeMask::is_majority_of(self.ok_votes.count(), configured_count) || self.replied == self.target
    }

    pub fn has_quorum(&self, configured_count: u32) -> bool {
        NodeMask::is_majority_of(self.ok_votes.count(), configured_count)
    }
}

pub struct Campaigner<L: LogSink, B: submerge_net::Bus> {
    me: NodeID,
    gen_mgr: Arc<GenerationManager<L>>,
    connectivity: Arc<ConnectivityTracker>,
    bus: Arc<B>,
    wake: Arc<Notifier>,
    sequence: AtomicI64,
    /// `(donor, observed_at)` from the most recent `CaughtUp` event the
    /// applier reported via `note_caught_up`, consulted by
    /// `recovery_caught_up` (§4.4 step 3's not-yet-a-member gate).
    caught_up_hint: RwLock<Option<(NodeID, NodeTime)>>,
}

impl<L: LogSink, B: submerge_net::Bus> Campaigner<L, B> {
    pub fn new(
        me: NodeID,
        gen_mgr: Arc<GenerationManager<L>>,
        connectivity: Arc<ConnectivityTracker>,
        bus: Arc<B>,
        wake: Arc<Notifier>,
    ) -> Self {
        Campaigner {
            me,
            gen_mgr,
            connectivity,
            bus,
            wake,
            sequence: AtomicI64::new(0),
            caught_up_hint: RwLock::new(None),
        }
    }

    fn config(&self) -> &Config {
        self.gen_mgr.config()
    }

    /// §4.4 step 1: wait on a notification or a randomized timeout
    /// (jitter in `[0, campaign_jitter)`). `last_seen` is this
    /// campaigner's own cursor into the shared `Notifier`.
    pub fn wait_for_wake(&self, last_seen: &mut u64) -> bool {
        let timeout = (self.config().heartbeat_send_timeout.as_std()) + jitter(self.config().campaign_jitter).as_std();
        self.wake.wait_timeout(last_seen, timeout)
    }

    /// §4.4 step 3. `clique` and `others_max_last_online_in` are
    /// snapshots the caller takes from the Connectivity Tracker before
    /// calling in (steps 1-2: "snapshot connectivity and generation
    /// state").
    pub fn decide(&self, clique: NodeMask) -> CampaignDecision {
        let current_gen = self.gen_mgr.current_gen();
        // `current_gen.configured` is only meaningful once some
        // generation has actually been switched into; before that
        // (the cluster bootstrap case, `current_gen.num == 0`) the
        // node's own `Config::configured` is the authoritative view of
        // cluster membership.
        let configured_count = self.config().configured.count();
        let im_in_clique = clique.contains(self.me.get());
        let clique_has_quorum = NodeMask::is_majority_of(clique.count(), configured_count);

        if !(clique_has_quorum && im_in_clique) {
            return self.decide_when_no_quorate_clique(clique);
        }

        let im_current_member = current_gen.members.contains(self.me.get());
        let bootstrapping = current_gen.num == 0;
        // Before any generation has ever been switched into,
        // `current_gen.members` is empty by construction (§3's
        // `Generation::INITIAL`), so `members ∩ clique` would always
        // collapse to nothing. The first generation this cluster ever
        // elects has no prior membership to intersect against; the
        // whole visible clique is the candidate set instead.
        let candidates = if bootstrapping {
            clique
        } else {
            current_gen.members.intersect(&clique).union(&NodeMask::single(self.me.get()))
        };

        if !NodeMask::is_majority_of(candidates.count(), configured_count) && im_current_member {
            return CampaignDecision::Skip;
        }

        if candidates == current_gen.members && !bootstrapping {
            let status = self.gen_mgr.status_in_gen();
            let last_vote = self.gen_mgr.last_vote();
            if status != StatusInGen::Dead || last_vote.gen.num == current_gen.num {
                return CampaignDecision::Skip;
            }
        }

        if !im_current_member && !bootstrapping && !self.recovery_caught_up(&current_gen) {
            return CampaignDecision::Skip;
        }

        CampaignDecision::Propose(candidates)
    }

    fn decide_when_no_quorate_clique(&self, clique: NodeMask) -> CampaignDecision {
        if self.gen_mgr.status_in_gen() != StatusInGen::Dead {
            return CampaignDecision::Skip;
        }
        let configured_count = self.config().configured.count();
        if !NodeMask::is_majority_of(clique.count(), configured_count) {
            return CampaignDecision::SetDisabled;
        }
        let best = clique
            .iter()
            .filter(|&id| id != self.me.get())
            .max_by_key(|&id| self.connectivity.others_last_online_in(NodeID(id)));
        match best {
            Some(donor) => CampaignDecision::SetCatchupHint(NodeID(donor)),
            None => CampaignDecision::SetDisabled,
        }
    }

    /// Spec §4.4 step 3's not-yet-a-member gate: the receiver must have
    /// reported caught up recently from the donor `receive_mode`
    /// currently points at, and our `last_online_in` must be at least
    /// that donor's.
    fn recovery_caught_up(&self, current_gen: &Generation) -> bool {
        let donor = match self.gen_mgr.receive_mode() {
            crate::status::ReceiveMode::Recovery { donor } => donor,
            _ => return false,
        };
        let hint = match *self.caught_up_hint.read().unwrap() {
            Some(h) => h,
            None => return false,
        };
        if hint.0 != donor {
            return false;
        }
        let stale_after = Duration(self.config().heartbeat_recv_timeout.0 * 5);
        if NodeTime::now().elapsed_since(hint.1) > stale_after {
            return false;
        }
        self.gen_mgr.last_online_in() >= self.connectivity.others_last_online_in(donor)
    }

    /// Records that the applier observed a `CaughtUp` transition from
    /// `donor`; consulted by `recovery_caught_up` above.
    pub fn note_caught_up(&self, donor: NodeID) {
        *self.caught_up_hint.write().unwrap() = Some((donor, NodeTime::now()));
    }

    /// §4.4 step 4-5: cast this node's own vote for `candidates`,
    /// persist it, and send `VoteRequest` to every other clique member.
    pub fn start_tour(&self, candidates: NodeMask, clique: NodeMask) -> Result<TourState> {
        let proposed = self.gen_mgr.begin_vote_tour(candidates)?;
        let target = clique.subtract(&NodeMask::single(self.me.get()));
        for peer in target.iter() {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            self.bus.send(Msg::request(
                self.me,
                NodeID(peer),
                sequence,
                BusMsg::VoteRequest { gen: proposed },
            ))?;
        }
        debug!(gen_num = proposed.num, ?candidates, "campaign tour started");
        Ok(TourState {
            gen: proposed,
            target,
            replied: NodeMask::EMPTY,
            ok_votes: NodeMask::single(self.me.get()),
            max_last_online_in: self.gen_mgr.last_online_in(),
            donors: NodeMask::single(self.me.get()),
            max_last_vote_num: 0,
        })
    }

    /// §4.4 step 6: fold one `VoteResponse` into the tour tally.
    pub fn on_vote_response(&self, tour: &mut TourState, from: NodeID, resp: &BusMsg) {
        let (gen_num, ok, last_online_in, last_vote_num) = match resp {
            BusMsg::VoteResponse {
                gen_num,
                ok,
                last_online_in,
                last_vote_num,
            } => (*gen_num, *ok, *last_online_in, *last_vote_num),
            _ => return,
        };
        if gen_num != tour.gen.num {
            return;
        }
        tour.replied.set(from.get(), true);
        if ok {
            tour.ok_votes.set(from.get(), true);
            if let Some(loi) = last_online_in {
                match loi.cmp(&tour.max_last_online_in) {
                    std::cmp::Ordering::Greater => {
                        tour.max_last_online_in = loi;
                        tour.donors = NodeMask::single(from.get());
                    }
                    std::cmp::Ordering::Equal => {
                        tour.donors.set(from.get(), true);
                    }
                    std::cmp::Ordering::Less => {}
                }
            }
        } else if let Some(lvn) = last_vote_num {
            tour.max_last_vote_num = tour.max_last_vote_num.max(lvn);
        }
    }

    /// §4.4 steps 7-8: once the tour is done, switch generation if
    /// quorum was reached, and always clear the tour flag, bumping
    /// `last_vote.num` if any reply revealed we'd fallen behind.
    pub fn finish_tour(&self, tour: TourState, barrier: &PrepareBarrier) -> Result<bool> {
        let configured_count = tour.gen.configured.count();
        let switched = if tour.has_quorum(configured_count) {
            self.gen_mgr.consider_gen_switch(barrier, tour.gen, tour.donors)?
        } else {
            false
        };
        if tour.max_last_vote_num > 0 {
            self.gen_mgr.bump_last_vote_num(tour.max_last_vote_num)?;
        }
        self.gen_mgr.clear_tour();
        Ok(switched)
    }

    /// Vote Handler (§4.4), invoked from the message loop for an
    /// incoming `Msg` whose body is `VoteRequest`. Builds the response
    /// envelope to hand back to the bus.
    pub fn handle_vote_request(&self, req: &Msg) -> Result<Option<Msg>> {
        let proposed = match req.body {
            BusMsg::VoteRequest { gen } => gen,
            _ => return Ok(None),
        };
        let clique = self.connectivity.clique(proposed.configured);
        let reply = self.gen_mgr.handle_vote_request(proposed, req.src, clique)?;
        Ok(Some(Msg::response(
            self.me,
            req.src,
            req.sequence,
            BusMsg::VoteResponse {
                gen_num: proposed.num,
                ok: reply.ok,
                last_online_in: reply.last_online_in,
                last_vote_num: reply.last_vote_num,
            },
        )))
    }
}

/// A lightweight, dependency-free source of jitter: hash the current
/// time with the process default `RandomState` (already randomly
/// seeded per-process by `std`) to avoid pulling in a `rand` crate for
/// one bounded random duration.
fn jitter(bound: Duration) -> Duration {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_i64(NodeTime::now().0);
    let r = hasher.finish();
    let bound = bound.0.max(1) as u64;
    Duration((r % bound) as i64)
}
