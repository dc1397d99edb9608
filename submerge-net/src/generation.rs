use crate::NodeID;
use serde::{Deserialize, Serialize};
use submerge_base::NodeMask;

/// An immutable record identifying a period of cluster life during
/// which `members` is the fixed set of nodes authorized to commit.
/// `num` is monotonic over the entire cluster's lifetime and two
/// distinct generations can never share a `num` (Safety-2).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Generation {
    pub num: u64,
    pub members: NodeMask,
    pub configured: NodeMask,
}

impl Generation {
    /// The generation prior to any election: nobody is a member yet.
    pub const INITIAL: Generation = Generation {
        num: 0,
        members: NodeMask::EMPTY,
        configured: NodeMask::EMPTY,
    };

    pub fn new(num: u64, members: NodeMask, configured: NodeMask) -> Self {
        debug_assert!(members.is_subset_of(&configured));
        Generation {
            num,
            members,
            configured,
        }
    }

    pub fn has_quorum(&self) -> bool {
        NodeMask::is_majority_of(self.members.count(), self.configured.count())
    }
}

// Generations are ordered by `num` only; `members`/`configured` are
// irrelevant to the total order used for vote comparisons (Safety-4).
impl Ord for Generation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.num.cmp(&other.num)
    }
}

impl PartialOrd for Generation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// `(counter, proposer_node_id)`, compared lexicographically. Used by
/// the resolver's single-decree Paxos round over a prepared
/// transaction's fate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
pub struct BallotTerm {
    pub counter: u64,
    pub proposer: Option<NodeID>,
}

impl BallotTerm {
    pub fn zero() -> Self {
        BallotTerm {
            counter: 0,
            proposer: None,
        }
    }

    pub fn next(self, proposer: NodeID) -> Self {
        BallotTerm {
            counter: self.counter + 1,
            proposer: Some(proposer),
        }
    }
}

impl std::fmt::Display for BallotTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.proposer {
            Some(p) => write!(f, "{}@{}", self.counter, p),
            None => write!(f, "{}@-", self.counter),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generation_ordered_by_num_only() {
        let a = Generation::new(1, NodeMask::from_ids([1]), NodeMask::from_ids([1, 2]));
        let b = Generation::new(2, NodeMask::from_ids([2]), NodeMask::from_ids([1, 2]));
        assert!(a < b);
    }

    #[test]
    fn ballot_term_lexicographic() {
        let a = BallotTerm {
            counter: 1,
            proposer: Some(NodeID(5)),
        };
        let b = BallotTerm {
            counter: 1,
            proposer: Some(NodeID(2)),
        };
        let c = BallotTerm {
            counter: 2,
            proposer: Some(NodeID(1)),
        };
        assert!(b < a); // same counter, lower proposer id sorts first
        assert!(a < c); // higher counter always wins
    }

    #[test]
    fn quorum_boundary() {
        let g = Generation::new(1, NodeMask::from_ids([1, 2]), NodeMask::from_ids([1, 2, 3]));
        assert!(!g.has_quorum());
        let g = Generation::new(1, NodeMask::from_ids([1, 2]), NodeMask::from_ids([1, 2]));
        assert!(g.has_quorum());
    }
}
