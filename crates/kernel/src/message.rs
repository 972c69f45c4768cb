use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message types for LLM calls
// ---------------------------------------------------------------------------

/// A chat message for LLM completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Standard chat roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

// ---------------------------------------------------------------------------
// CompletionRequest — one prompt/response exchange
// ---------------------------------------------------------------------------

/// A single completion request: exactly one system instruction followed by
/// one user prompt.
///
/// Requests are built fresh for every call and never reused. Neither field
/// is validated; the transport passes them through as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system_instruction: String,
    pub user_prompt: String,
}

impl CompletionRequest {
    pub fn new(system_instruction: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            user_prompt: user_prompt.into(),
        }
    }

    /// The wire message sequence: system first, then user.
    pub fn to_messages(&self) -> Vec<Message> {
        vec![
            Message {
                role: MessageRole::System,
                content: self.system_instruction.clone(),
            },
            Message {
                role: MessageRole::User,
                content: self.user_prompt.clone(),
            },
        ]
    }
}
