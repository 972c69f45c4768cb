use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// UsageRecord — accumulator for token usage
// ---------------------------------------------------------------------------

/// Tracks cumulative usage across multiple LLM calls within a run.
///
/// Stages build their own record and the controller merges them, so no
/// record is ever shared between concurrent tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub call_count: u64,
}

impl UsageRecord {
    /// Record usage from one LLM call.
    pub fn record(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.total_tokens += prompt_tokens + completion_tokens;
        self.call_count += 1;
    }

    /// Fold another record into this one.
    pub fn merge(&mut self, other: &UsageRecord) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.call_count += other.call_count;
    }

    /// Single-line summary for operator output.
    pub fn display(&self) -> String {
        let calls = self.call_count;
        let call_label = if calls == 1 { "call" } else { "calls" };
        format!(
            "Tokens: {} ({} prompt / {} completion) | {} {}",
            self.total_tokens, self.prompt_tokens, self.completion_tokens, calls, call_label,
        )
    }
}

// ---------------------------------------------------------------------------
// RetryBudget — bounded refinement passes
// ---------------------------------------------------------------------------

/// Bounds the number of refinement passes the loop may perform.
///
/// The reference behavior is a single pass; `max_passes` of zero means
/// "build once and report".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_passes: u32,
    pub passes_used: u32,
}

impl RetryBudget {
    pub const DEFAULT_PASSES: u32 = 1;

    pub fn new(max_passes: u32) -> Self {
        Self {
            max_passes,
            passes_used: 0,
        }
    }

    /// True while another refinement pass is allowed.
    pub fn has_remaining(&self) -> bool {
        self.passes_used < self.max_passes
    }

    /// Consume one pass. Returns the 1-based pass number, or `None` when the
    /// budget is already spent.
    pub fn consume(&mut self) -> Option<u32> {
        if !self.has_remaining() {
            return None;
        }
        self.passes_used += 1;
        Some(self.passes_used)
    }

    pub fn remaining(&self) -> u32 {
        self.max_passes.saturating_sub(self.passes_used)
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PASSES)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
