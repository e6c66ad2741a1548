use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    FetchingMetadata,
    Downloading,
    Paused,
    Assembling,
    Completed,
    Error,
    Canceled,
}

impl TaskState {
    /// No transitions leave a terminal state, absent an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Canceled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Idle => "Idle",
            TaskState::FetchingMetadata => "FetchingMetadata",
            TaskState::Downloading => "Downloading",
            TaskState::Paused => "Paused",
            TaskState::Assembling => "Assembling",
            TaskState::Completed => "Completed",
            TaskState::Error => "Error",
            TaskState::Canceled => "Canceled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(TaskState::Idle),
            "FetchingMetadata" => Ok(TaskState::FetchingMetadata),
            "Downloading" => Ok(TaskState::Downloading),
            "Paused" => Ok(TaskState::Paused),
            "Assembling" => Ok(TaskState::Assembling),
            "Completed" => Ok(TaskState::Completed),
            "Error" => Ok(TaskState::Error),
            "Canceled" => Ok(TaskState::Canceled),
            _ => Err(()),
        }
    }
}
