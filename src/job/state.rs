//! Job states as reported by the server and task status as seen by callers

use std::fmt;

/// `JobState` of a concrete job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    New,
    Starting,
    Running,
    Suspended,
    ShuttingDown,
    Completed,
    Terminated,
    Killed,
    Exception,
    CompletedWithWarnings,
}

impl JobState {
    pub fn from_code(code: u16) -> Option<Self> {
        let state = match code {
            2 => JobState::New,
            3 => JobState::Starting,
            4 => JobState::Running,
            5 => JobState::Suspended,
            6 => JobState::ShuttingDown,
            7 => JobState::Completed,
            8 => JobState::Terminated,
            9 => JobState::Killed,
            10 => JobState::Exception,
            32768 => JobState::CompletedWithWarnings,
            _ => return None,
        };
        Some(state)
    }

    pub fn code(self) -> u16 {
        match self {
            JobState::New => 2,
            JobState::Starting => 3,
            JobState::Running => 4,
            JobState::Suspended => 5,
            JobState::ShuttingDown => 6,
            JobState::Completed => 7,
            JobState::Terminated => 8,
            JobState::Killed => 9,
            JobState::Exception => 10,
            JobState::CompletedWithWarnings => 32768,
        }
    }

    /// Terminal states are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::CompletedWithWarnings
                | JobState::Terminated
                | JobState::Killed
                | JobState::Exception
        )
    }

    /// Whether the server may move a job from `self` to `next`
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        if self == next {
            return true;
        }
        match self {
            New => matches!(next, Starting | Running) || next.is_terminal(),
            Starting => next == Running || next.is_terminal(),
            Running => matches!(next, Suspended | ShuttingDown) || next.is_terminal(),
            Suspended => next == Running || next.is_terminal(),
            ShuttingDown => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Caller-facing outcome of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Running,
    CompletedSuccessfully,
    Canceled,
    CompletedWithErrors,
}

impl TaskStatus {
    /// `failed` marks a job that was deleted or lost its connection before
    /// reaching a terminal state
    pub fn from_state(state: JobState, failed: bool) -> Self {
        match state {
            JobState::Completed | JobState::CompletedWithWarnings => {
                TaskStatus::CompletedSuccessfully
            }
            JobState::Terminated | JobState::Killed => TaskStatus::Canceled,
            JobState::Exception => TaskStatus::CompletedWithErrors,
            _ if failed => TaskStatus::CompletedWithErrors,
            _ => TaskStatus::Running,
        }
    }

    pub fn is_finished(self) -> bool {
        self != TaskStatus::Running
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::Running => "running",
            TaskStatus::CompletedSuccessfully => "completed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::CompletedWithErrors => "failed",
        };
        f.write_str(text)
    }
}
