use submerge_net::Generation;

/// The highest generation this node has cast a YES vote for (§3).
/// Wrapped rather than a bare `Generation` so `PersistentState` reads
/// clearly at each call site (`last_vote.gen.num`, not a second
/// anonymous `Generation`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoteState {
    pub gen: Generation,
}

impl VoteState {
    pub fn initial() -> Self {
        VoteState {
            gen: Generation::INITIAL,
        }
    }
}
