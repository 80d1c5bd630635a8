//! What to do with a trigger that arrives for a session.
//!
//! [`decide`] is pure: it only looks at the trigger, a snapshot of the
//! session's live run, and the configured queue mode. The dispatcher applies
//! the chosen [`Action`].

use runlane_core::QueueMode;

/// An inbound message for a session.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    pub session_key: String,
    pub session_id: String,
    pub body: String,
    /// Originating surface (e.g. `discord`), used for per-surface modes and
    /// follow-up routing.
    pub channel: Option<String>,
    /// Destination on the surface (e.g. `channel:123`).
    pub to: Option<String>,
}

impl Trigger {
    pub fn new(session_key: &str, session_id: &str, body: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            session_id: session_id.to_string(),
            body: body.to_string(),
            channel: None,
            to: None,
        }
    }

    #[must_use]
    pub fn with_route(mut self, channel: &str, to: &str) -> Self {
        self.channel = Some(channel.to_string());
        self.to = Some(to.to_string());
        self
    }
}

/// Snapshot of the session at decision time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    /// A turn is running for the session.
    pub active: bool,
    /// The running turn accepts steering.
    pub streaming: bool,
    /// Queued, not-yet-started work on the session lane or follow-up queue.
    pub queued: usize,
}

/// What happens when steering is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerFallback {
    /// Queue the trigger as a follow-up (`steer-backlog`).
    Followup,
    /// Refuse the trigger while the run is still active (`steer`).
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// `steer` mode and the live run refused the injection.
    SteerRefused,
    /// The follow-up queue is full and its drop policy refuses new items.
    QueueFull,
    /// Nothing to run.
    EmptyPrompt,
}

impl RejectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SteerRefused => "steer_refused",
            Self::QueueFull => "queue_full",
            Self::EmptyPrompt => "empty_prompt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a new turn.
    RunNow,
    /// Inject the trigger into the streaming turn.
    Steer { fallback: SteerFallback },
    /// Run after the current turn.
    EnqueueFollowup,
    /// Drop queued work, abort the live turn, then start a new one.
    Interrupt,
    Reject { reason: RejectReason },
}

/// Map a trigger and the session's live state to an action.
pub fn decide(trigger: &Trigger, state: RunState, mode: QueueMode) -> Action {
    if trigger.body.trim().is_empty() {
        return Action::Reject {
            reason: RejectReason::EmptyPrompt,
        };
    }

    match mode {
        QueueMode::Interrupt if state.active || state.queued > 0 => Action::Interrupt,
        _ if !state.active => Action::RunNow,
        QueueMode::Steer if state.streaming => Action::Steer {
            fallback: SteerFallback::Reject,
        },
        QueueMode::SteerBacklog if state.streaming => Action::Steer {
            fallback: SteerFallback::Followup,
        },
        // `steer` with a run that is not streaming waits for the next turn.
        QueueMode::Steer | QueueMode::SteerBacklog | QueueMode::Followup | QueueMode::Collect => {
            Action::EnqueueFollowup
        }
        QueueMode::Interrupt => Action::RunNow,
    }
}

/// Resolve a refused steer.
///
/// Once the run has ended there is nothing left to wait behind, so both
/// fallbacks start a new turn.
pub const fn resolve_steer_refusal(fallback: SteerFallback, still_active: bool) -> Action {
    match (fallback, still_active) {
        (_, false) => Action::RunNow,
        (SteerFallback::Followup, true) => Action::EnqueueFollowup,
        (SteerFallback::Reject, true) => Action::Reject {
            reason: RejectReason::SteerRefused,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> Trigger {
        Trigger::new("agent:main:main", "sess", "hello")
    }

    const IDLE: RunState = RunState {
        active: false,
        streaming: false,
        queued: 0,
    };
    const STREAMING: RunState = RunState {
        active: true,
        streaming: true,
        queued: 0,
    };
    const BUSY: RunState = RunState {
        active: true,
        streaming: false,
        queued: 0,
    };

    #[test]
    fn idle_session_runs_now_in_every_mode() {
        for mode in [
            QueueMode::Steer,
            QueueMode::SteerBacklog,
            QueueMode::Followup,
            QueueMode::Collect,
            QueueMode::Interrupt,
        ] {
            assert_eq!(decide(&trigger(), IDLE, mode), Action::RunNow, "{mode}");
        }
    }

    #[test]
    fn interrupt_with_live_run_or_backlog() {
        assert_eq!(
            decide(&trigger(), STREAMING, QueueMode::Interrupt),
            Action::Interrupt
        );
        let backlog = RunState { queued: 1, ..IDLE };
        assert_eq!(
            decide(&trigger(), backlog, QueueMode::Interrupt),
            Action::Interrupt
        );
    }

    #[test]
    fn steer_modes_target_streaming_runs() {
        assert_eq!(
            decide(&trigger(), STREAMING, QueueMode::Steer),
            Action::Steer {
                fallback: SteerFallback::Reject
            }
        );
        assert_eq!(
            decide(&trigger(), STREAMING, QueueMode::SteerBacklog),
            Action::Steer {
                fallback: SteerFallback::Followup
            }
        );
    }

    #[test]
    fn non_streaming_run_gets_followup() {
        for mode in [
            QueueMode::Steer,
            QueueMode::SteerBacklog,
            QueueMode::Followup,
            QueueMode::Collect,
        ] {
            assert_eq!(
                decide(&trigger(), BUSY, mode),
                Action::EnqueueFollowup,
                "{mode}"
            );
        }
    }

    #[test]
    fn followup_modes_never_steer() {
        assert_eq!(
            decide(&trigger(), STREAMING, QueueMode::Collect),
            Action::EnqueueFollowup
        );
        assert_eq!(
            decide(&trigger(), STREAMING, QueueMode::Followup),
            Action::EnqueueFollowup
        );
    }

    #[test]
    fn blank_body_is_rejected() {
        let blank = Trigger::new("k", "s", "   ");
        assert_eq!(
            decide(&blank, IDLE, QueueMode::Collect),
            Action::Reject {
                reason: RejectReason::EmptyPrompt
            }
        );
    }

    #[test]
    fn steer_refusal_resolution() {
        assert_eq!(
            resolve_steer_refusal(SteerFallback::Followup, true),
            Action::EnqueueFollowup
        );
        assert_eq!(
            resolve_steer_refusal(SteerFallback::Reject, true),
            Action::Reject {
                reason: RejectReason::SteerRefused
            }
        );
        assert_eq!(
            resolve_steer_refusal(SteerFallback::Reject, false),
            Action::RunNow
        );
        assert_eq!(
            resolve_steer_refusal(SteerFallback::Followup, false),
            Action::RunNow
        );
    }
}
