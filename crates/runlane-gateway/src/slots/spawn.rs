//! Two-dimensional reservation for a spawn attempt.

use tracing::debug;

use super::pool::{Reservation, SlotPool, SlotUsage};

/// Why [`SpawnSlots::reserve`] refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotDenied {
    /// The requester already has `max` children running or pending.
    ParentLimit { usage: SlotUsage, max: usize },
    /// The provider is at its global cap.
    ProviderLimit {
        provider: String,
        usage: SlotUsage,
        max: usize,
    },
}

/// Both slots held by one spawn. Dropping releases whatever is still held.
#[derive(Debug)]
pub struct SpawnReservations {
    pub child: Reservation,
    pub provider: Reservation,
}

impl SpawnReservations {
    /// Mark both slots active once the run record is registered.
    pub fn commit(&mut self) {
        self.child.commit();
        self.provider.commit();
    }

    /// Release both slots. Safe to call more than once.
    pub fn release(&mut self) {
        self.provider.release();
        self.child.release();
    }

    pub fn is_released(&self) -> bool {
        self.child.is_released() && self.provider.is_released()
    }
}

/// The child pool (keyed by requester session) and the provider pool.
#[derive(Clone)]
pub struct SpawnSlots {
    pub children: SlotPool,
    pub providers: SlotPool,
}

impl Default for SpawnSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl SpawnSlots {
    pub fn new() -> Self {
        Self {
            children: SlotPool::new("child"),
            providers: SlotPool::new("provider"),
        }
    }

    /// Reserve a child slot, then a provider slot.
    ///
    /// If the provider pool refuses, the child slot is released before
    /// returning, leaving both pools as they were.
    pub fn reserve(
        &self,
        requester: &str,
        max_children: usize,
        provider: &str,
        provider_limit: usize,
    ) -> Result<SpawnReservations, SlotDenied> {
        let Some(mut child) = self.children.try_reserve(requester, max_children) else {
            return Err(SlotDenied::ParentLimit {
                usage: self.children.usage(requester),
                max: max_children,
            });
        };

        let Some(provider_slot) = self.providers.try_reserve(provider, provider_limit) else {
            self.children.release(&mut child);
            debug!(requester, provider, "Provider pool full, child slot released");
            return Err(SlotDenied::ProviderLimit {
                provider: provider.to_string(),
                usage: self.providers.usage(provider),
                max: provider_limit,
            });
        };

        Ok(SpawnReservations {
            child,
            provider: provider_slot,
        })
    }

    /// Re-account a run restored from storage.
    pub fn restore(&self, requester: &str, provider: &str) -> SpawnReservations {
        SpawnReservations {
            child: self.children.restore(requester),
            provider: self.providers.restore(provider),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn provider_failure_restores_child_usage() {
        let slots = SpawnSlots::new();
        let _busy = slots.providers.try_reserve("openai", 1).unwrap();
        let before = slots.children.usage("agent:main:main");

        let err = slots.reserve("agent:main:main", 5, "openai", 1).unwrap_err();
        match err {
            SlotDenied::ProviderLimit {
                provider,
                usage,
                max,
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(usage.pending, 1);
                assert_eq!(max, 1);
            }
            SlotDenied::ParentLimit { .. } => panic!("expected provider limit"),
        }
        assert_eq!(slots.children.usage("agent:main:main"), before);
    }

    #[test]
    fn parent_limit_touches_nothing() {
        let slots = SpawnSlots::new();
        let _held = slots.reserve("req", 1, "openai", 4).unwrap();
        let err = slots.reserve("req", 1, "openai", 4).unwrap_err();
        assert!(matches!(err, SlotDenied::ParentLimit { max: 1, .. }));
        assert_eq!(slots.providers.usage("openai").total, 1);
    }

    #[test]
    fn commit_and_release_pair() {
        let slots = SpawnSlots::new();
        let mut held = slots.reserve("req", 2, "anthropic", 2).unwrap();
        held.commit();
        assert_eq!(slots.children.usage("req").active, 1);
        assert_eq!(slots.providers.usage("anthropic").active, 1);
        held.release();
        held.release();
        assert!(held.is_released());
        assert_eq!(slots.children.usage("req").total, 0);
        assert_eq!(slots.providers.usage("anthropic").total, 0);
    }
}
