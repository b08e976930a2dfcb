//! Operating states and the transition table.

use crate::protocol::FaultFlags;
use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Operating state, as carried by the heartbeat and the state change command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum State {
    Idle = 0,
    Precharge = 1,
    Run = 2,
    Charged = 3,
    Balance = 4,
    Error = 5,
    /// Never entered. Only used as a command to leave [`State::Error`].
    ErrorUnlock = 255,
}

impl State {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::Precharge => "Precharge",
            State::Run => "Run",
            State::Charged => "Charged",
            State::Balance => "Balance",
            State::Error => "Error",
            State::ErrorUnlock => "ErrorUnlock",
        }
    }
}

impl TryFrom<u8> for State {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Error> {
        Ok(match code {
            0 => State::Idle,
            1 => State::Precharge,
            2 => State::Run,
            3 => State::Charged,
            4 => State::Balance,
            5 => State::Error,
            255 => State::ErrorUnlock,
            _ => return Err(Error::UnknownState(code)),
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Reason {
    RunCommand,
    IdleCommand,
    ErrorCommand,
    Unlock,
    PrechargeComplete,
    PrechargeTimeout,
    HeartbeatTimeout,
    OverVoltage,
    UnderVoltage,
    OverChargeCurrent,
    OverDischargeCurrent,
    /// Pack or cell voltage reached the charge limit.
    ChargeComplete,
    /// Pack or cell voltage dropped below the charge cut-in.
    ChargeResume,
    /// Bring-up override, bypasses the table.
    Forced,
}

impl Reason {
    /// Fault flags raised together with this reason.
    pub fn fault(self) -> FaultFlags {
        match self {
            Reason::ErrorCommand => FaultFlags::UNKNOWN,
            Reason::PrechargeTimeout => FaultFlags::PRECHARGE_FAIL,
            Reason::HeartbeatTimeout => FaultFlags::HEARTBEAT_TIMEOUT,
            Reason::OverVoltage => FaultFlags::OVER_VOLTAGE_LOCKOUT,
            Reason::UnderVoltage => FaultFlags::UNDER_VOLTAGE_LOCKOUT,
            Reason::OverChargeCurrent => FaultFlags::OVER_CHARGE_CURRENT,
            Reason::OverDischargeCurrent => FaultFlags::OVER_DISCHARGE_CURRENT,
            _ => FaultFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub reason: Reason,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({:?})", self.from, self.to, self.reason)
    }
}

/// The transition table.
///
/// Returns `None` when `reason` does not move the machine out of `from`.
/// Apart from [`Reason::Unlock`] nothing leaves [`State::Error`].
pub fn next(from: State, reason: Reason) -> Option<Transition> {
    let to = match (from, reason) {
        (State::ErrorUnlock, _) => return None,
        (State::Error, Reason::Unlock) => State::Idle,
        (State::Error, _) | (_, Reason::Unlock) | (_, Reason::Forced) => return None,

        (State::Idle, Reason::RunCommand) => State::Precharge,
        (_, Reason::RunCommand) => return None,
        (_, Reason::IdleCommand) => State::Idle,
        (State::Precharge, Reason::PrechargeComplete) => State::Run,
        (State::Run | State::Balance, Reason::ChargeComplete) => State::Charged,
        (State::Charged, Reason::ChargeResume) => State::Run,
        (State::Idle, Reason::HeartbeatTimeout) => return None,
        (_, Reason::HeartbeatTimeout) => State::Idle,
        (State::Precharge, Reason::PrechargeTimeout) => State::Error,
        (
            _,
            Reason::ErrorCommand
            | Reason::OverVoltage
            | Reason::UnderVoltage
            | Reason::OverChargeCurrent
            | Reason::OverDischargeCurrent,
        ) => State::Error,
        _ => return None,
    };

    Some(Transition { from, to, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [State; 6] = [
        State::Idle,
        State::Precharge,
        State::Run,
        State::Charged,
        State::Balance,
        State::Error,
    ];

    const REASONS: [Reason; 14] = [
        Reason::RunCommand,
        Reason::IdleCommand,
        Reason::ErrorCommand,
        Reason::Unlock,
        Reason::PrechargeComplete,
        Reason::PrechargeTimeout,
        Reason::HeartbeatTimeout,
        Reason::OverVoltage,
        Reason::UnderVoltage,
        Reason::OverChargeCurrent,
        Reason::OverDischargeCurrent,
        Reason::ChargeComplete,
        Reason::ChargeResume,
        Reason::Forced,
    ];

    #[test]
    fn codes() {
        for state in STATES.into_iter().chain([State::ErrorUnlock]) {
            assert_eq!(State::try_from(state.code()).unwrap(), state);
        }
        assert!(matches!(State::try_from(6), Err(Error::UnknownState(6))));
    }

    #[test]
    fn only_unlock_leaves_error() {
        for reason in REASONS {
            let transition = next(State::Error, reason);
            if reason == Reason::Unlock {
                assert_eq!(transition.unwrap().to, State::Idle);
            } else {
                assert_eq!(transition, None, "{reason:?}");
            }
        }
    }

    #[test]
    fn unlock_outside_error_is_a_no_op() {
        for state in STATES.into_iter().filter(|s| *s != State::Error) {
            assert_eq!(next(state, Reason::Unlock), None, "{state}");
        }
    }

    #[test]
    fn run_command_only_from_idle() {
        assert_eq!(
            next(State::Idle, Reason::RunCommand).unwrap().to,
            State::Precharge
        );
        for state in [State::Precharge, State::Run, State::Charged, State::Balance] {
            assert_eq!(next(state, Reason::RunCommand), None, "{state}");
        }
    }

    #[test]
    fn faults_go_to_error() {
        for state in STATES.into_iter().filter(|s| *s != State::Error) {
            for reason in [
                Reason::ErrorCommand,
                Reason::OverVoltage,
                Reason::UnderVoltage,
                Reason::OverChargeCurrent,
                Reason::OverDischargeCurrent,
            ] {
                let transition = next(state, reason).unwrap();
                assert_eq!(transition.to, State::Error);
                assert!(!reason.fault().is_empty());
            }
        }
    }

    #[test]
    fn heartbeat_timeout_goes_idle() {
        assert_eq!(next(State::Idle, Reason::HeartbeatTimeout), None);
        for state in [State::Precharge, State::Run, State::Charged, State::Balance] {
            assert_eq!(
                next(state, Reason::HeartbeatTimeout).unwrap().to,
                State::Idle
            );
        }
    }

    #[test]
    fn charge_cycle() {
        assert_eq!(
            next(State::Run, Reason::ChargeComplete).unwrap().to,
            State::Charged
        );
        assert_eq!(
            next(State::Balance, Reason::ChargeComplete).unwrap().to,
            State::Charged
        );
        assert_eq!(next(State::Idle, Reason::ChargeComplete), None);
        assert_eq!(
            next(State::Charged, Reason::ChargeResume).unwrap().to,
            State::Run
        );
        assert_eq!(next(State::Run, Reason::ChargeResume), None);
    }

    #[test]
    fn precharge_outcomes() {
        assert_eq!(
            next(State::Precharge, Reason::PrechargeComplete).unwrap().to,
            State::Run
        );
        assert_eq!(
            next(State::Precharge, Reason::PrechargeTimeout).unwrap().to,
            State::Error
        );
        assert_eq!(next(State::Run, Reason::PrechargeTimeout), None);
        assert_eq!(next(State::Idle, Reason::PrechargeComplete), None);
    }
}
