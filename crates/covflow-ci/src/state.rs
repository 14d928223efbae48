//! Pipeline-wide state machine.
//!
//! ```text
//! Idle -> Provisioning -> Building -> Testing -> Aggregating -> Publishing -> Succeeded
//!   |          |             |           |            |              |
//!   +----------+-------------+-----------+------------+--------------+---> Failed
//! Idle -> Skipped (trigger did not match)
//! ```

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Provisioning,
    Building,
    Testing,
    Aggregating,
    Publishing,
    Succeeded,
    Failed,
    Skipped,
}

/// Result of the work done in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

impl PipelineState {
    /// The single transition function.
    ///
    /// Success moves one state forward, failure moves to `Failed` from any
    /// non-terminal state, and terminal states never move.
    pub fn advance(self, outcome: StepOutcome) -> PipelineState {
        use PipelineState::*;

        if self.is_terminal() {
            return self;
        }
        match outcome {
            StepOutcome::Failed => Failed,
            StepOutcome::Succeeded => match self {
                Idle => Provisioning,
                Provisioning => Building,
                Building => Testing,
                Testing => Aggregating,
                Aggregating => Publishing,
                Publishing => Succeeded,
                Succeeded | Failed | Skipped => self,
            },
        }
    }

    /// Leave `Idle` without running anything. Other states are unchanged.
    pub fn skip(self) -> PipelineState {
        match self {
            PipelineState::Idle => PipelineState::Skipped,
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::Failed | PipelineState::Skipped
        )
    }

    /// The stage executed while in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Provisioning => Some(Stage::Provision),
            PipelineState::Building => Some(Stage::Build),
            PipelineState::Testing => Some(Stage::Test),
            PipelineState::Aggregating => Some(Stage::Aggregate),
            PipelineState::Publishing => Some(Stage::Publish),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Provisioning => "provisioning",
            PipelineState::Building => "building",
            PipelineState::Testing => "testing",
            PipelineState::Aggregating => "aggregating",
            PipelineState::Publishing => "publishing",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
            PipelineState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
