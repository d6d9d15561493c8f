use crate::error::{OrchestratorError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session lifecycle. Advances forward only; resuming from a checkpoint is
/// the one transition allowed to move a session back to [`Phase::Mapping`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialized,
    Scouting,
    Chunking,
    Mapping,
    Reducing,
    Completed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Scouting => "scouting",
            Self::Chunking => "chunking",
            Self::Mapping => "mapping",
            Self::Reducing => "reducing",
            Self::Completed => "completed",
        }
    }

    /// Staying put or moving forward. Scouting is optional, so skipping
    /// phases is allowed.
    pub fn can_advance_to(self, next: Phase) -> bool {
        next >= self
    }

    /// Resume may rewind a session that was interrupted while mapping or
    /// reducing; a completed session is final.
    pub fn can_resume(self) -> bool {
        matches!(self, Self::Mapping | Self::Reducing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a forward transition for `operation` on session `id`.
pub(crate) fn check_advance(id: &str, current: Phase, next: Phase, operation: &str) -> Result<()> {
    if current.can_advance_to(next) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidPhase {
            id: id.to_string(),
            phase: current,
            operation: operation.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        assert!(Phase::Initialized.can_advance_to(Phase::Chunking));
        assert!(Phase::Mapping.can_advance_to(Phase::Mapping));
        assert!(!Phase::Reducing.can_advance_to(Phase::Mapping));
        assert!(check_advance("s", Phase::Completed, Phase::Scouting, "explore").is_err());
    }

    #[test]
    fn only_interrupted_work_can_resume() {
        assert!(Phase::Mapping.can_resume());
        assert!(Phase::Reducing.can_resume());
        assert!(!Phase::Completed.can_resume());
        assert!(!Phase::Chunking.can_resume());
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Phase::Reducing).unwrap(), "\"reducing\"");
        assert_eq!(Phase::Scouting.to_string(), "scouting");
    }
}
