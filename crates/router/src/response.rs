use serde::{Deserialize, Serialize};

/// Response from an LLM completion call, before any normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Raw text content of the first choice.
    pub content: String,

    /// Resolved model string as reported back by the provider.
    pub model: String,

    /// Prompt tokens used.
    pub prompt_tokens: u64,

    /// Completion tokens used.
    pub completion_tokens: u64,

    /// Total tokens used.
    pub total_tokens: u64,

    /// Roundtrip latency in milliseconds.
    pub latency_ms: u64,
}
