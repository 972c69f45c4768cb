use std::sync::Arc;
use std::time::Duration;

use testloom_kernel::message::CompletionRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fence::strip_code_fences;
use crate::provider::{CompletionParams, Provider, ProviderError};

// ---------------------------------------------------------------------------
// CompletionClient
// ---------------------------------------------------------------------------

/// A successful, normalized completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Completion text with code fences and surrounding whitespace removed.
    pub text: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
}

/// Why a completion produced nothing usable. Every variant is recoverable:
/// callers skip the affected unit and carry on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("service returned no completion")]
    NoCompletion,

    #[error("request timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("request cancelled")]
    Cancelled,
}

/// Per-request behavior of the client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub model: String,
    pub params: CompletionParams,
    /// Upper bound on a single request, including reading the body.
    pub timeout: Duration,
    /// Attempts on rate limits and transient HTTP errors (at least 1).
    pub max_attempts: u32,
    /// Base wait between attempts; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl ClientSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            params: CompletionParams::default(),
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Issues single completion requests against a `Provider`.
///
/// Holds no mutable state, so one client can be shared by any number of
/// concurrent tasks.
pub struct CompletionClient {
    provider: Arc<dyn Provider>,
    settings: ClientSettings,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn Provider>, settings: ClientSettings) -> Self {
        Self { provider, settings }
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Send `request` and return the fence-stripped completion text.
    ///
    /// Retries on rate limiting and transient HTTP errors. An empty choice
    /// list, or a completion that is empty once stripped, is
    /// `CompletionError::NoCompletion`.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, CompletionError> {
        let messages = request.to_messages();
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            let call = self
                .provider
                .complete(&self.settings.model, &messages, &self.settings.params);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                r = tokio::time::timeout(self.settings.timeout, call) => r,
            };

            let result = match outcome {
                Ok(r) => r,
                Err(_elapsed) => {
                    return Err(CompletionError::TimedOut {
                        secs: self.settings.timeout.as_secs(),
                    });
                }
            };

            let wait = match result {
                Ok(response) => {
                    let text = strip_code_fences(&response.content);
                    if text.is_empty() {
                        return Err(CompletionError::NoCompletion);
                    }
                    debug!(
                        model = %response.model,
                        tokens = response.total_tokens,
                        latency_ms = response.latency_ms,
                        "completion: received"
                    );
                    return Ok(Completion {
                        text,
                        model: response.model,
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                        total_tokens: response.total_tokens,
                        latency_ms: response.latency_ms,
                    });
                }
                Err(ProviderError::NoChoices) => return Err(CompletionError::NoCompletion),
                Err(ProviderError::RateLimited { retry_after_ms }) => {
                    let wait = retry_after_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.settings.backoff * attempt);
                    warn!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "completion: rate limited"
                    );
                    last_err = Some(format!("rate limited on attempt {attempt}"));
                    wait
                }
                Err(ProviderError::Http(e)) if attempt < max_attempts => {
                    warn!(attempt, error = %e, "completion: transient HTTP error, retrying");
                    last_err = Some(e.to_string());
                    self.settings.backoff * attempt
                }
                Err(e) => return Err(CompletionError::Transport(e.to_string())),
            };

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        Err(CompletionError::Transport(format!(
            "exhausted retries: {}",
            last_err.unwrap_or_else(|| "unknown".into())
        )))
    }
}
