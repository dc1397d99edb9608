//! Node identity, wire-level messages, and the transport boundary the
//! coordination core is driven through. Nothing in this crate performs
//! I/O; it only defines the shapes and the trait seam.

mod generation;
mod ids;
mod msg;
mod node;
mod record;
mod time;
mod transport;

pub use generation::{BallotTerm, Generation};
pub use ids::{Gid, NodeID};
pub use msg::{BusMsg, Msg, TxRequestKind, TxStatus, WaitEdge};
pub use node::{BusLink, RecvMsg};
pub use record::{LogSink, LogicalRecord};
pub use time::{Duration, NodeTime, RealmTime};
pub use transport::{Bus, ConnectionEvents};
