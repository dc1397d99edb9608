//! Shared test harness for `submerge-txn`: an in-memory message fabric
//! standing in for the real transport so a whole small cluster can run
//! in one process, with controllable drops and partitions.

mod fabric;

pub use fabric::{Fabric, FabricBus};
