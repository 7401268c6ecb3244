//! Session state machine: states, the guarded adjacency table, and the
//! mapping from internal state to the OCPP `ChargePointStatus` a
//! StatusNotification should carry.

use serde::{Deserialize, Serialize};

use crate::error::StateMachineError;
use crate::ocpp::messages::ChargePointStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    BootAccepted,
    Available,
    Parked,
    Plugged,
    Authorizing,
    Authorized,
    Starting,
    Charging,
    SuspendedEvse,
    SuspendedEv,
    Stopping,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    Disconnecting,
}

impl SessionState {
    /// The OCPP status a StatusNotification should report while in this state.
    pub fn ocpp_status(self) -> ChargePointStatus {
        use SessionState::*;
        match self {
            Available | Parked | BootAccepted => ChargePointStatus::Available,
            Plugged | Authorizing | Authorized | Starting => ChargePointStatus::Preparing,
            Charging | Stopping => ChargePointStatus::Charging,
            SuspendedEvse => ChargePointStatus::SuspendedEVSE,
            SuspendedEv => ChargePointStatus::SuspendedEV,
            Finishing => ChargePointStatus::Finishing,
            Reserved => ChargePointStatus::Reserved,
            Unavailable => ChargePointStatus::Unavailable,
            Faulted => ChargePointStatus::Faulted,
            // Disconnected/Connecting/Connected/Disconnecting have no OCPP
            // mapping: no StatusNotification is sent while not yet booted.
            Disconnected | Connecting | Connected | Disconnecting => ChargePointStatus::Unavailable,
        }
    }

    fn allowed_targets(self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Disconnected => &[Connecting],
            Connecting => &[Connected, Disconnected],
            Connected => &[BootAccepted, Disconnected],
            BootAccepted => &[Available, Plugged, Parked, Faulted, Disconnecting],
            Available => &[Parked, Plugged, Reserved, Unavailable, Faulted, Disconnecting],
            Parked => &[Plugged, Available, Faulted, Disconnecting],
            Plugged => &[Authorizing, Available, Faulted],
            Authorizing => &[Authorized, Plugged, Faulted],
            Authorized => &[Starting, Plugged, Faulted],
            Starting => &[Charging, Authorized, Plugged, Faulted],
            Charging => &[Stopping, SuspendedEvse, SuspendedEv, Faulted],
            SuspendedEvse => &[Charging, Stopping, Faulted],
            SuspendedEv => &[Charging, Stopping, Faulted],
            Stopping => &[Finishing, Faulted],
            Finishing => &[Available, Plugged, Parked],
            Reserved => &[Available, Plugged],
            Faulted => &[Available, Unavailable, Disconnected],
            Unavailable => &[Available, Faulted],
            Disconnecting => &[Disconnected],
        }
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        self.allowed_targets().contains(&to)
    }
}

/// Wraps a session's current [`SessionState`] and performs guarded
/// transitions, returning whether a StatusNotification is owed.
#[derive(Debug, Clone, Copy)]
pub struct SessionStateMachine {
    state: SessionState,
    last_emitted_status: Option<ChargePointStatus>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            last_emitted_status: None,
        }
    }

    pub fn current(&self) -> SessionState {
        self.state
    }

    /// Attempt a transition. On success, returns `Some(status)` exactly when
    /// the mapped OCPP status differs from the last one emitted (so the
    /// caller sends StatusNotification); returns `None` when the status is
    /// unchanged. A rejected transition never mutates state.
    pub fn transition(
        &mut self,
        to: SessionState,
    ) -> Result<Option<ChargePointStatus>, StateMachineError> {
        if !self.state.can_transition_to(to) {
            return Err(StateMachineError {
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        self.state = to;
        let mapped = to.ocpp_status();
        if Some(mapped) != self.last_emitted_status {
            self.last_emitted_status = Some(mapped);
            Ok(Some(mapped))
        } else {
            Ok(None)
        }
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn initial_state_is_disconnected() {
        let sm = SessionStateMachine::new();
        assert_eq!(sm.current(), SessionState::Disconnected);
    }

    #[test]
    fn happy_path_nominal_transaction() {
        let mut sm = SessionStateMachine::new();
        assert!(sm.transition(SessionState::Connecting).unwrap().is_none());
        assert!(sm.transition(SessionState::Connected).unwrap().is_none());
        assert_eq!(
            sm.transition(SessionState::BootAccepted).unwrap(),
            Some(ChargePointStatus::Available)
        );
        // BootAccepted -> Available maps to the same status: no re-emit.
        assert_eq!(sm.transition(SessionState::Available).unwrap(), None);
        assert_eq!(
            sm.transition(SessionState::Plugged).unwrap(),
            Some(ChargePointStatus::Preparing)
        );
        assert_eq!(sm.transition(SessionState::Authorizing).unwrap(), None);
        assert_eq!(sm.transition(SessionState::Authorized).unwrap(), None);
        assert_eq!(sm.transition(SessionState::Starting).unwrap(), None);
        assert_eq!(
            sm.transition(SessionState::Charging).unwrap(),
            Some(ChargePointStatus::Charging)
        );
    }

    #[test]
    fn rejected_transition_does_not_mutate_state() {
        let mut sm = SessionStateMachine::new();
        let err = sm.transition(SessionState::Charging);
        assert!(err.is_err());
        assert_eq!(sm.current(), SessionState::Disconnected);
    }

    #[test]
    fn rejected_transition_never_goes_to_faulted() {
        let mut sm = SessionStateMachine::new();
        let before = sm.current();
        let _ = sm.transition(SessionState::Charging);
        assert_ne!(sm.current(), SessionState::Faulted);
        assert_eq!(sm.current(), before);
    }

    #[rstest]
    #[case(SessionState::Charging, SessionState::SuspendedEvse, true)]
    #[case(SessionState::SuspendedEvse, SessionState::Charging, true)]
    #[case(SessionState::Reserved, SessionState::Plugged, true)]
    #[case(SessionState::Finishing, SessionState::Unavailable, false)]
    #[case(SessionState::Faulted, SessionState::Charging, false)]
    fn adjacency_table_matches_design(
        #[case] from: SessionState,
        #[case] to: SessionState,
        #[case] expected: bool,
    ) {
        assert_eq!(from.can_transition_to(to), expected);
    }
}
