//! Pipeline stages and the transition table.

use serde::{Deserialize, Serialize};

/// Where a content item is in its journey to publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Filtered,
    Downloaded,
    Edited,
    Captioned,
    PendingApproval,
    Published,
    Skipped,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Discovered,
        Stage::Filtered,
        Stage::Downloaded,
        Stage::Edited,
        Stage::Captioned,
        Stage::PendingApproval,
        Stage::Published,
        Stage::Skipped,
        Stage::Failed,
    ];

    /// Published, Skipped and Failed end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Published | Stage::Skipped | Stage::Failed)
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// The forward path is linear, with `PendingApproval` as an optional step
    /// between `Captioned` and `Published`. Any non-terminal stage may drop to
    /// `Skipped` or `Failed`. Terminal stages have no successors.
    pub fn can_transition_to(self, to: Stage) -> bool {
        use Stage::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, to),
            (_, Skipped)
                | (_, Failed)
                | (Discovered, Filtered)
                | (Filtered, Downloaded)
                | (Downloaded, Edited)
                | (Edited, Captioned)
                | (Captioned, PendingApproval)
                | (Captioned, Published)
                | (PendingApproval, Published)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Filtered => "filtered",
            Stage::Downloaded => "downloaded",
            Stage::Edited => "edited",
            Stage::Captioned => "captioned",
            Stage::PendingApproval => "pending_approval",
            Stage::Published => "published",
            Stage::Skipped => "skipped",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
