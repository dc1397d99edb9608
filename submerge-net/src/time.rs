use crate::NodeID;
use serde::{Deserialize, Serialize};

/// A virtual time-point in signed 64-bit microseconds since the epoch.
/// Sufficient to span 292,471 years.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeTime(pub i64);

/// A time-span in signed 64-bit microseconds, relative to some
/// `NodeTime` or used as a timeout/interval.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Duration(pub i64);

impl Duration {
    pub fn from_millis(ms: i64) -> Self {
        Duration(ms * 1000)
    }

    pub fn as_millis(self) -> i64 {
        self.0 / 1000
    }

    pub fn as_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.max(0) as u64)
    }
}

impl NodeTime {
    pub fn now() -> Self {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        NodeTime(since_epoch.as_micros() as i64)
    }

    pub fn elapsed_since(self, earlier: NodeTime) -> Duration {
        Duration(self.0 - earlier.0)
    }

    pub fn checked_add(self, d: Duration) -> NodeTime {
        NodeTime(self.0 + d.0)
    }
}

/// Realm-local extended timestamps. The most significant field is a
/// `NodeTime` (microsecond count), followed by a `NodeID` and an event
/// counter, so that every node can label events with a totally-ordered
/// timestamp without coordinating with any other node, and with
/// arbitrarily many sub-microsecond events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RealmTime {
    pub time: NodeTime,
    pub node: NodeID,
    pub event: i64,
}
