pub mod openai;

use std::future::Future;
use std::pin::Pin;

use testloom_kernel::message::Message;

use crate::response::CompletionResponse;

/// Boxed future returned by Provider methods (for dyn compatibility).
pub type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A provider handles the actual HTTP call to an LLM API.
///
/// Each provider knows how to translate our generic `Message` format
/// into the provider-specific request shape and parse the response back.
pub trait Provider: Send + Sync {
    /// Make a completion call.
    fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &CompletionParams,
    ) -> ProviderFuture<'_>;
}

/// Optional sampling parameters. Unset fields are left out of the request
/// so the service applies its own defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Errors from a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("response contained no choices")]
    NoChoices,

    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
}
