//! Application lifecycle states reported by the process supervisor.
//!
//! States are bit codes so that a set of past states fits in one integer
//! (`pastApplicationStates`).

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ApplicationState {
    /// Unknown state
    Nil = 0,
    Starting = 1,
    Running = 2,
    Stopping = 4,
    Killing = 8,
    ProcessingFailure = 16,
    Failure = 32,
    Success = 64,
    Stopped = 128,
    Killed = 256,
}

const ALL_STATES: [ApplicationState; 9] = [
    ApplicationState::Starting,
    ApplicationState::Running,
    ApplicationState::Stopping,
    ApplicationState::Killing,
    ApplicationState::ProcessingFailure,
    ApplicationState::Failure,
    ApplicationState::Success,
    ApplicationState::Stopped,
    ApplicationState::Killed,
];

impl ApplicationState {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Unknown codes map to [`ApplicationState::Nil`].
    pub fn from_code(code: i32) -> Self {
        ALL_STATES
            .into_iter()
            .find(|state| state.code() == code)
            .unwrap_or(Self::Nil)
    }

    /// True once the application can no longer publish or reply.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Stopped | Self::Killed | Self::Failure
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nil => "NIL",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Killing => "KILLING",
            Self::ProcessingFailure => "PROCESSING_FAILURE",
            Self::Failure => "FAILURE",
            Self::Success => "SUCCESS",
            Self::Stopped => "STOPPED",
            Self::Killed => "KILLED",
        }
    }

    /// Expand a `pastApplicationStates` bit set into its states.
    pub fn decompose(states: i32) -> Vec<Self> {
        ALL_STATES
            .into_iter()
            .filter(|state| states & state.code() != 0)
            .collect()
    }
}

impl FromStr for ApplicationState {
    type Err = std::convert::Infallible;

    /// Unknown names parse to [`ApplicationState::Nil`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ALL_STATES
            .into_iter()
            .find(|state| state.as_str() == s)
            .unwrap_or(Self::Nil))
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
