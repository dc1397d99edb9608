use serde::{Deserialize, Serialize};
use submerge_net::NodeID;

/// Derived, not stored (§3): a node's standing relative to its own
/// `current_gen`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StatusInGen {
    /// `last_online_in == current_gen.num`.
    Online,
    /// A member of `current_gen`, the generation has quorum by design,
    /// and `last_vote.num == current_gen.num`: no promise forbids
    /// reaching ONLINE from here.
    Recovery,
    /// This generation will never admit this node.
    Dead,
}

/// User-facing status (§3), combining status-in-gen with clique
/// coverage and campaigner tour state. Distinct from `StatusInGen`:
/// a node can be status-in-gen ONLINE yet user-facing ISOLATED if the
/// clique no longer covers `current_gen.members`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum UserStatus {
    Disabled,
    Catchup,
    Recovery,
    Isolated,
    Online,
}

/// The receive-side counterpart to `current_gen`: whether this node's
/// applier is disabled, caught up and replaying normally, or still
/// recovering from a specific donor. One concrete enum owned by the
/// Generation Manager rather than a pair of bitmasks plus a slot
/// number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ReceiveMode {
    Disabled,
    Normal,
    Recovery { donor: NodeID },
}

/// Named transitions the Generation Manager logs one `info!` per.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GenerationEvent {
    SwitchedAsDonor { gen_num: u64 },
    SwitchedAsRecovering { gen_num: u64, donor: NodeID },
    SwitchedDisabled { gen_num: u64 },
    BecameOnline { gen_num: u64 },
    CaughtUp { gen_num: u64 },
    NonRecoverableError,
}
