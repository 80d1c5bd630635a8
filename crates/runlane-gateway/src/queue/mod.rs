//! Trigger handling while a session may already be running.
//!
//! - [`policy`]: the pure queue-mode decision.
//! - [`followup`]: per-session follow-up queues.
//! - [`directives`]: inline `/queue`, `/think` and `/status` directives.
//! - [`dispatcher`]: applies decisions against lanes and live runs.

pub mod directives;
pub mod dispatcher;
pub mod followup;
pub mod policy;

pub use directives::{ParsedDirectives, parse_directives};
pub use dispatcher::{DispatchOutcome, Dispatcher, RunTicket};
pub use followup::{EnqueueResult, FollowupItem, FollowupQueues, QueueSettings};
pub use policy::{Action, RejectReason, RunState, SteerFallback, Trigger, decide, resolve_steer_refusal};
