use std::fmt;

use serde::Serialize;

/// Lifecycle state of a work manager.
///
/// ```text
/// New -> Working <-> Paused
///          |          |
///          +-> Draining <-+
///          |      |
///          +------+-> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkState {
    New = 0,
    Working = 1,
    Paused = 2,
    Draining = 3,
    Stopped = 4,
}

impl WorkState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkState::New,
            1 => WorkState::Working,
            2 => WorkState::Paused,
            3 => WorkState::Draining,
            _ => WorkState::Stopped,
        }
    }

    /// Whether workers may be running in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkState::Working | WorkState::Paused | WorkState::Draining
        )
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkState::New => "new",
            WorkState::Working => "working",
            WorkState::Paused => "paused",
            WorkState::Draining => "draining",
            WorkState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip_covers_every_state() {
        for state in [
            WorkState::New,
            WorkState::Working,
            WorkState::Paused,
            WorkState::Draining,
            WorkState::Stopped,
        ] {
            assert_eq!(WorkState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn only_running_states_are_active() {
        assert!(!WorkState::New.is_active());
        assert!(WorkState::Working.is_active());
        assert!(WorkState::Paused.is_active());
        assert!(WorkState::Draining.is_active());
        assert!(!WorkState::Stopped.is_active());
    }
}
