//! Pipeline run states and the transitions allowed between them.
//!
//! ```text
//! Idle → Normalizing → ReturnComputing → Aggregating → Reconciling → Done
//!              ╰──────────────┴──────────────┴─────────────┴──→ Failed { stage, reason }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A processing stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Normalizing,
    ReturnComputing,
    Aggregating,
    Reconciling,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Normalizing,
        PipelineStage::ReturnComputing,
        PipelineStage::Aggregating,
        PipelineStage::Reconciling,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::Normalizing => "normalizing",
            PipelineStage::ReturnComputing => "return_computing",
            PipelineStage::Aggregating => "aggregating",
            PipelineStage::Reconciling => "reconciling",
        }
    }

    /// The stage that follows this one, `None` after the last.
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Normalizing => Some(PipelineStage::ReturnComputing),
            PipelineStage::ReturnComputing => Some(PipelineStage::Aggregating),
            PipelineStage::Aggregating => Some(PipelineStage::Reconciling),
            PipelineStage::Reconciling => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running { stage: PipelineStage },
    Done,
    Failed { stage: PipelineStage, reason: String },
}

/// An illegal state change was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} from state {from}")]
pub struct TransitionError {
    pub from: String,
    pub action: &'static str,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed { .. })
    }

    /// Stage currently running, if any.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineState::Running { stage } | PipelineState::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Move to the next stage; `Reconciling` advances to `Done`.
    pub fn advance(&self) -> Result<PipelineState, TransitionError> {
        match self {
            PipelineState::Idle => Ok(PipelineState::Running {
                stage: PipelineStage::Normalizing,
            }),
            PipelineState::Running { stage } => Ok(match stage.next() {
                Some(next) => PipelineState::Running { stage: next },
                None => PipelineState::Done,
            }),
            _ => Err(TransitionError {
                from: self.to_string(),
                action: "advance",
            }),
        }
    }

    /// Fail the running stage.
    pub fn fail(&self, reason: impl Into<String>) -> Result<PipelineState, TransitionError> {
        match self {
            PipelineState::Running { stage } => Ok(PipelineState::Failed {
                stage: *stage,
                reason: reason.into(),
            }),
            _ => Err(TransitionError {
                from: self.to_string(),
                action: "fail",
            }),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::Running { stage } => write!(f, "running({stage})"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Failed { stage, reason } => write!(f, "failed({stage}): {reason}"),
        }
    }
}
