use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Pending,
    Scheduled,
    Queued,
    Running,
    Done,
    Stopped,
    Disrupted,
    Failed,
}

impl DiscoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryStatus::Done
                | DiscoveryStatus::Stopped
                | DiscoveryStatus::Disrupted
                | DiscoveryStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::Pending => "pending",
            DiscoveryStatus::Scheduled => "scheduled",
            DiscoveryStatus::Queued => "queued",
            DiscoveryStatus::Running => "running",
            DiscoveryStatus::Done => "done",
            DiscoveryStatus::Stopped => "stopped",
            DiscoveryStatus::Disrupted => "disrupted",
            DiscoveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a remote discovery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryView {
    pub id: String,
    pub name: String,
    pub status: DiscoveryStatus,
}
