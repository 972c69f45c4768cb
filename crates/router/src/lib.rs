pub mod client;
pub mod fence;
pub mod provider;
pub mod response;

pub use client::{ClientSettings, Completion, CompletionClient, CompletionError};
pub use provider::openai::{OPENROUTER_API_URL, OpenAiProvider};
pub use provider::{CompletionParams, Provider, ProviderError};
pub use response::CompletionResponse;
