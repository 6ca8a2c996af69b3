use std::fmt;

use uuid::Uuid;

use crate::error::SessionFailure;

/// Lifecycle of the session client's current turn.
///
/// `Failed` is only published once the retry budget is spent; while retries remain
/// the client goes back to `Connecting` with a higher attempt number. A transport
/// that reconnects on its own within one attempt bumps `reconnect` instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionState {
    #[default]
    Idle,
    /// Opening the transport. `attempt` is the turn-level attempt (1-based);
    /// `reconnect` counts the transport's own reconnects within that attempt.
    Connecting { attempt: u32, reconnect: u32 },
    Streaming,
    Completed,
    Cancelled,
    Failed(SessionFailure),
}

impl SessionState {
    /// Whether the turn has ended (or never started).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Completed | Self::Cancelled | Self::Failed(_)
        )
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Connecting { attempt, reconnect } if *attempt > 1 || *reconnect > 0)
    }

    pub(crate) fn connecting(attempt: u32) -> Self {
        Self::Connecting {
            attempt,
            reconnect: 0,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting {
                attempt: 1,
                reconnect: 0,
            } => write!(f, "connecting"),
            Self::Connecting {
                attempt,
                reconnect: 0,
            } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Connecting { attempt, reconnect } => {
                write!(f, "reconnecting (attempt {attempt}, socket retry {reconnect})")
            }
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// Summary of one finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub correlation_id: Uuid,
    /// `Completed`, `Cancelled` or `Failed`.
    pub outcome: SessionState,
    /// Transport opens made for the turn, including the first.
    pub attempts: u32,
    /// Turn retries plus transport-level reconnects.
    pub reconnects: u32,
    /// Canonical events committed to the store.
    pub events: usize,
}

impl TurnReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == SessionState::Completed
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        match &self.outcome {
            SessionState::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
