//! runlane gateway library
//!
//! The run-scheduling core of the gateway:
//! - Lane scheduling for session and global lanes
//! - Queue-mode decisions for triggers arriving during a live turn
//! - Child and provider slot pools for sub-agent spawning
//! - Sub-agent spawn coordination and the persisted run registry
//! - The compaction safeguard that keeps history inside the token budget

pub mod compaction;
pub mod gateway;
pub mod lanes;
pub mod queue;
pub mod runs;
pub mod slots;
pub mod storage;
pub mod subagent;

pub use gateway::{Gateway, GatewayCollaborators};
