use std::fmt;

use serde::Serialize;

use super::error::{RecorderError, RecorderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Recording,
    Draining,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderEvent {
    Start,
    Stop,
    Flushed,
    DeviceFailed,
}

impl RecorderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderState::Idle => "idle",
            RecorderState::Recording => "recording",
            RecorderState::Draining => "draining",
            RecorderState::Stopped => "stopped",
            RecorderState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecorderState::Stopped | RecorderState::Error)
    }

    /// Transition table. Anything not listed is rejected.
    pub fn apply(self, event: RecorderEvent) -> RecorderResult<RecorderState> {
        use RecorderEvent::*;
        use RecorderState::*;
        let next = match (self, event) {
            (Idle, Start) => Recording,
            (Recording, Stop) => Draining,
            (Recording, DeviceFailed) => Error,
            (Draining, Flushed) => Stopped,
            (Draining, DeviceFailed) => Error,
            (from, event) => return Err(RecorderError::InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RecorderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecorderEvent::Start => "start",
            RecorderEvent::Stop => "stop",
            RecorderEvent::Flushed => "flushed",
            RecorderEvent::DeviceFailed => "device_failed",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let state = RecorderState::Idle
            .apply(RecorderEvent::Start)
            .and_then(|s| s.apply(RecorderEvent::Stop))
            .and_then(|s| s.apply(RecorderEvent::Flushed))
            .unwrap();
        assert_eq!(state, RecorderState::Stopped);
        assert!(state.is_terminal());
    }

    #[test]
    fn terminal_states_reject_everything() {
        for state in [RecorderState::Stopped, RecorderState::Error] {
            for event in [
                RecorderEvent::Start,
                RecorderEvent::Stop,
                RecorderEvent::Flushed,
                RecorderEvent::DeviceFailed,
            ] {
                assert!(state.apply(event).is_err(), "{state} accepted {event}");
            }
        }
    }

    #[test]
    fn cannot_stop_before_starting() {
        let err = RecorderState::Idle.apply(RecorderEvent::Stop).unwrap_err();
        assert!(matches!(
            err,
            RecorderError::InvalidTransition {
                from: RecorderState::Idle,
                event: RecorderEvent::Stop
            }
        ));
    }

    #[test]
    fn device_failure_while_recording_is_an_error_state() {
        let state = RecorderState::Recording
            .apply(RecorderEvent::DeviceFailed)
            .unwrap();
        assert_eq!(state, RecorderState::Error);
    }
}
