//! Session status and its transition function.
//!
//! Every status change goes through [`SessionState::apply`], including the
//! ones triggered by device link loss.

use crate::device::types::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the gateway's (single) sensing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Idle, no session running.
    Ready,
    /// Devices are being connected and configured; samples are ignored.
    AwaitingStart,
    /// Collecting; frames are produced.
    Active,
    /// A device dropped while collecting. Persists until the next start.
    Disconnected,
}

/// Something that happened to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Activated,
    /// A device's link dropped without being asked to.
    UnexpectedDisconnect(DeviceId),
    /// Connect or configuration failed before collection began.
    Aborted,
    /// Collection ended and every device was released.
    Finished,
}

impl SessionState {
    /// Next state after `event`. Events that do not apply leave the state unchanged.
    pub fn apply(self, event: &SessionEvent) -> SessionState {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Ready | S::Disconnected, E::Started) => S::AwaitingStart,
            (S::AwaitingStart, E::Activated) => S::Active,
            (S::Active, E::UnexpectedDisconnect(_)) => S::Disconnected,
            (S::AwaitingStart | S::Active, E::Aborted) => S::Ready,
            (S::AwaitingStart | S::Active, E::Finished) => S::Ready,
            (state, _) => state,
        }
    }

    /// Whether samples arriving now may contribute to frames.
    ///
    /// Collection continues for the remaining devices after a disconnect.
    pub fn accepts_samples(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Disconnected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::AwaitingStart => "awaiting_start",
            SessionState::Active => "active",
            SessionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> SessionEvent {
        SessionEvent::UnexpectedDisconnect(DeviceId::new("J"))
    }

    #[test]
    fn test_normal_lifecycle() {
        let s = SessionState::Ready
            .apply(&SessionEvent::Started)
            .apply(&SessionEvent::Activated);
        assert_eq!(s, SessionState::Active);
        assert_eq!(s.apply(&SessionEvent::Finished), SessionState::Ready);
    }

    #[test]
    fn test_disconnect_only_counts_while_active() {
        assert_eq!(SessionState::Active.apply(&lost()), SessionState::Disconnected);
        assert_eq!(
            SessionState::AwaitingStart.apply(&lost()),
            SessionState::AwaitingStart
        );
        assert_eq!(SessionState::Ready.apply(&lost()), SessionState::Ready);
    }

    #[test]
    fn test_disconnected_survives_finish_until_restart() {
        let s = SessionState::Disconnected.apply(&SessionEvent::Finished);
        assert_eq!(s, SessionState::Disconnected);
        assert_eq!(s.apply(&SessionEvent::Started), SessionState::AwaitingStart);
    }

    #[test]
    fn test_abort_returns_to_ready() {
        assert_eq!(
            SessionState::AwaitingStart.apply(&SessionEvent::Aborted),
            SessionState::Ready
        );
    }

    #[test]
    fn test_start_ignored_while_running() {
        assert_eq!(
            SessionState::Active.apply(&SessionEvent::Started),
            SessionState::Active
        );
        assert_eq!(
            SessionState::AwaitingStart.apply(&SessionEvent::Started),
            SessionState::AwaitingStart
        );
    }

    #[test]
    fn test_sample_gate() {
        assert!(!SessionState::Ready.accepts_samples());
        assert!(!SessionState::AwaitingStart.accepts_samples());
        assert!(SessionState::Active.accepts_samples());
        assert!(SessionState::Disconnected.accepts_samples());
    }
}
