//! The coordinator core (§2): generation management, three-phase
//! commit, connectivity tracking and clique selection, and the
//! surrounding machinery (resolver, deadlock detector, referee client)
//! that makes a multi-master cluster safe to run.

mod barrier;
mod campaign;
mod config;
mod connectivity;
mod coordinator;
mod deadlock;
mod generation_mgr;
mod notify;
mod participant;
mod persist;
mod referee;
mod resolver;
mod status;
mod votestate;

pub use barrier::{HolderGuard, PrepareBarrier, PreparerGuard};
pub use campaign::{CampaignDecision, Campaigner, TourState};
pub use config::Config;
pub use connectivity::{ConnectivityTracker, HeartbeatInfo};
pub use coordinator::{begin as begin_transaction, AbortReason, PrepareOutcome, TransactionCoordinator};
pub use deadlock::{DeadlockDetector, Vertex, WaitForGraph};
pub use generation_mgr::{ApplyOutcome, GenerationManager, VoteReply};
pub use notify::Notifier;
pub use participant::{ParticipantOutcome, TransactionParticipant};
pub use persist::{ControlFile, PersistentState, RoundStore, Store};
pub use referee::{RefereeClient, RefereeDecision};
pub use resolver::{Phase1State, Phase2State, PromiseReply, ResolvedValue, Resolver};
pub use status::{GenerationEvent, ReceiveMode, StatusInGen, UserStatus};
pub use votestate::VoteState;
