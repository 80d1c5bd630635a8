//! Lane-based task scheduling.
//!
//! Session lanes (`session:{key}`) serialize the turns of one conversation;
//! global lanes bound work across sessions. A turn holds its session lane and
//! a global lane while it runs.

pub mod scheduler;

pub use scheduler::{EnqueueOptions, LaneError, LaneScheduler};

/// Global lane for top-level agent turns.
pub const LANE_MAIN: &str = "main";
/// Global lane for sub-agent turns.
pub const LANE_SUBAGENT: &str = "subagent";
/// Global lane for compaction summarization calls.
pub const LANE_COMPACTION: &str = "compaction";
