use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::budget::UsageRecord;

// ---------------------------------------------------------------------------
// LoopState — the build-refine state machine
// ---------------------------------------------------------------------------

/// States of the generate/build/refine loop.
///
/// ```text
/// Generating -> Building -> Done
///                  |  ^
///                  v  |
///               Refining        (while retry budget remains)
///                  |
///                  v
///           BudgetExhausted     (failure with no budget left)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Generating,
    Building,
    Refining,
    Done,
    BudgetExhausted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::BudgetExhausted)
    }
}

// ---------------------------------------------------------------------------
// RunContext — mutable state threaded through a run
// ---------------------------------------------------------------------------

/// Mutable state carried through the loop by the controller.
pub struct RunContext {
    /// Identifier for this run (used in events and history).
    pub run_id: String,

    /// Current state.
    pub state: LoopState,

    /// Events emitted so far.
    pub events: Vec<RunEvent>,

    /// Usage summed over every completed stage.
    pub usage: UsageRecord,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: LoopState::Generating,
            events: Vec::new(),
            usage: UsageRecord::default(),
        }
    }

    /// Record an event stamped with the current time.
    pub fn emit(&mut self, kind: EventKind, data: serde_json::Value) {
        self.events.push(RunEvent {
            kind,
            timestamp: Utc::now().to_rfc3339(),
            run_id: self.run_id.clone(),
            data,
        });
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: LoopState) -> LoopState {
        std::mem::replace(&mut self.state, next)
    }
}

// ---------------------------------------------------------------------------
// UnitFailure — a per-unit problem that did not stop the batch
// ---------------------------------------------------------------------------

/// A unit or artifact that a stage had to skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub name: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// RunResult — outcome of a full run
// ---------------------------------------------------------------------------

/// The result of one generate/build/refine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Overall status.
    pub status: RunStatus,

    /// How many times the build ran.
    pub build_invocations: u32,

    /// How many refinement passes ran.
    pub refinement_passes: u32,

    /// Paths of artifacts written by generation.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    /// Units generation skipped.
    #[serde(default)]
    pub skipped_units: Vec<UnitFailure>,

    /// Token usage over the whole run.
    #[serde(default)]
    pub usage: UsageRecord,

    /// Output of the last build, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_output: Option<String>,

    /// Events emitted during execution.
    #[serde(default)]
    pub events: Vec<RunEvent>,

    /// Error message if the run did not finish cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Done
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The build came back clean.
    Done,
    /// Refinement passes ran out with the build still failing.
    BudgetExhausted,
    /// Cancelled by the operator.
    Cancelled,
    /// The run could not continue (build failed to start, output dir unwritable).
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Done => "done",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RunEvent — structured event log
// ---------------------------------------------------------------------------

/// An event emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Event type.
    pub kind: EventKind,

    /// ISO 8601 timestamp.
    pub timestamp: String,

    /// Run this event belongs to.
    pub run_id: String,

    /// Event-specific data.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Types of run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GenerationStarted,
    ArtifactWritten,
    UnitSkipped,
    BuildFinished,
    RefinementStarted,
    ArtifactRefined,
    ArtifactUnchanged,
    RunFinished,
}
