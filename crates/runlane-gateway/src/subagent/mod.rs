//! Sub-agent spawning.
//!
//! - [`SpawnCoordinator`]: validation, slot admission and dispatch of child runs
//! - [`RunRegistry`]: run records holding their slots until the run ends
//! - [`verify_artifacts`]: post-run checks against a [`VerificationContract`]
//! - [`build_delegation_prompt`]: system prompt announcing the delegation

pub mod coordinator;
pub mod patch;
pub mod prompt;
pub mod registry;
pub mod tools;
pub mod verification;

pub use coordinator::{BlockReason, SpawnCoordinator, SpawnErrorReason, SpawnOutcome, SpawnParams};
pub use patch::{NoopPatcher, PatchError, SessionPatch, SessionPatcher, ThinkingPatch};
pub use prompt::{DelegationContext, DelegationTier, FleetEntry, build_delegation_prompt};
pub use registry::{RunOutcome, RunRegistry, RunStatus, SubagentRunRecord};
pub use tools::{ConfigToolCatalog, ToolCatalog};
pub use verification::{
    OnFailure, VerificationArtifact, VerificationContract, VerificationResult, VerificationStatus,
    verify_artifacts,
};
