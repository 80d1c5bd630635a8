//! Turn execution.
//!
//! - [`RunExecutor`]: the external, abortable turn invocation.
//! - [`ActiveRuns`]: live turns per session, with steer and abort.
//! - [`run_turn`]: executes one turn under a timeout and keeps
//!   [`ActiveRuns`] consistent on every exit path.

pub mod active;
pub mod executor;

pub use active::{ActiveRuns, LiveRun, RunHandle};
pub use executor::{RunError, RunExecutor, RunResult, TurnContext, TurnRequest, run_turn};
