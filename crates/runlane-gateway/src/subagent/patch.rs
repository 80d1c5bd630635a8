//! Session patch collaborator used to apply spawn overrides.

use async_trait::async_trait;
use runlane_core::ThinkLevel;

/// Thinking change carried by a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingPatch {
    Set(ThinkLevel),
    /// Remove the session's thinking override.
    Clear,
}

impl ThinkingPatch {
    /// `off` clears the override instead of setting it.
    pub const fn from_level(level: ThinkLevel) -> Self {
        match level {
            ThinkLevel::Off => Self::Clear,
            other => Self::Set(other),
        }
    }
}

/// Fields to change on a session. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub model: Option<String>,
    pub thinking: Option<ThinkingPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PatchError(pub String);

impl PatchError {
    /// Errors that degrade to a warning: the model was refused, the session
    /// keeps its default.
    pub fn is_recoverable_model_error(&self) -> bool {
        self.0.contains("invalid model") || self.0.contains("model not allowed")
    }
}

/// Idempotent session update.
#[async_trait]
pub trait SessionPatcher: Send + Sync {
    async fn patch(&self, session_key: &str, patch: SessionPatch) -> Result<(), PatchError>;
}

/// Patcher for deployments without session overrides.
pub struct NoopPatcher;

#[async_trait]
impl SessionPatcher for NoopPatcher {
    async fn patch(&self, _session_key: &str, _patch: SessionPatch) -> Result<(), PatchError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_clears_thinking() {
        assert_eq!(ThinkingPatch::from_level(ThinkLevel::Off), ThinkingPatch::Clear);
        assert_eq!(
            ThinkingPatch::from_level(ThinkLevel::High),
            ThinkingPatch::Set(ThinkLevel::High)
        );
    }

    #[test]
    fn recognizes_recoverable_model_errors() {
        assert!(PatchError("invalid model: foo/bar".into()).is_recoverable_model_error());
        assert!(PatchError("model not allowed".into()).is_recoverable_model_error());
        assert!(!PatchError("gateway unreachable".into()).is_recoverable_model_error());
    }
}
