use serde::{Deserialize, Serialize};
use submerge_base::NodeMask;
use submerge_net::{Duration, NodeID};

/// The named, defaulted options of the configuration surface (§6).
/// GUC plumbing itself (how these values reach the process) is out of
/// scope; this struct is what a loader populates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeID,
    pub configured: NodeMask,

    /// Period between outgoing heartbeats.
    pub heartbeat_send_timeout: Duration,
    /// Peer considered down if no heartbeat arrives within this long.
    pub heartbeat_recv_timeout: Duration,
    /// Lower bound on a coordinator's wait for participant acks.
    pub min_2pc_timeout: Duration,
    /// Coordinator wait = max(min_2pc_timeout, prepare_wall_time * ratio / 100).
    pub max_2pc_ratio: u32,
    /// Drop a disabled peer's recovery slot if WAL lag exceeds this
    /// many bytes.
    pub max_recovery_lag: u64,
    /// Switch a recovering peer to "almost caught up" once WAL lag
    /// drops below this many bytes.
    pub min_recovery_lag: u64,
    /// Spill an applied transaction to disk past this size.
    pub trans_spill_threshold: u64,
    /// Optional referee endpoint; `None` disables the referee path.
    pub referee_conn_string: Option<String>,
    /// Serialize apply per origin node.
    pub preserve_commit_order: bool,

    /// Upper bound (exclusive) of the campaigner's randomized
    /// collision-avoidance jitter, added to its wake timeout.
    pub campaign_jitter: Duration,

    /// Policy knob for the minority-generation case: when a
    /// minority (referee-granted) generation is elected, whether
    /// transactions prepared in the prior majority generation but not
    /// yet committed must be resolved as abort.
    pub minority_gen_aborts_inherited_prepares: bool,

    /// Apply-worker stall duration treated as evidence of a deadlock
    /// cycle even absent a graph loop (§4.9).
    pub deadlock_stall_timeout: Duration,
}

impl Config {
    /// Conservative defaults: a 3s campaign jitter bound, referee
    /// disabled, commit order not pinned.
    pub fn new(node_id: NodeID, configured: NodeMask) -> Self {
        Config {
            node_id,
            configured,
            heartbeat_send_timeout: Duration::from_millis(1000),
            heartbeat_recv_timeout: Duration::from_millis(5000),
            min_2pc_timeout: Duration::from_millis(2000),
            max_2pc_ratio: 100,
            max_recovery_lag: 16 * 1024 * 1024,
            min_recovery_lag: 1024 * 1024,
            trans_spill_threshold: 64 * 1024 * 1024,
            referee_conn_string: None,
            preserve_commit_order: false,
            campaign_jitter: Duration::from_millis(3000),
            minority_gen_aborts_inherited_prepares: true,
            deadlock_stall_timeout: Duration::from_millis(30_000),
        }
    }
}
