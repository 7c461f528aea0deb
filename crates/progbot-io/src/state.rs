//! Lifecycle state of the peripheral worker.

use serde::{Deserialize, Serialize};

/// Worker lifecycle. Transitions are strictly
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No worker process (initial state, and after every `stop()`)
    #[default]
    Stopped,
    /// Spawning the worker process
    Starting,
    /// Worker spawned and registered
    Running,
    /// Escalation ladder in progress
    Stopping,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
