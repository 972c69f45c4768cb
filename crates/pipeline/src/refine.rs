use std::sync::Arc;

use testloom_kernel::budget::UsageRecord;
use testloom_kernel::pipeline::UnitFailure;
use testloom_router::client::CompletionClient;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::TestArtifact;
use crate::generate::TaskOutcome;
use crate::prompts::PromptSet;

/// What one refinement pass did.
#[derive(Debug, Default)]
pub struct RefinementReport {
    /// Artifacts whose content was replaced, sorted by name.
    pub refined: Vec<TestArtifact>,
    /// Artifacts left exactly as they were, with the reason.
    pub unchanged: Vec<UnitFailure>,
    pub usage: UsageRecord,
}

/// Repairs every artifact against the full build log, in parallel.
///
/// There is no attempt to match diagnostics to files: each artifact is sent
/// with the whole log and the model decides what applies.
pub struct RefinementStage {
    client: Arc<CompletionClient>,
    prompts: Arc<PromptSet>,
    concurrency: usize,
}

impl RefinementStage {
    pub fn new(client: Arc<CompletionClient>, prompts: Arc<PromptSet>, concurrency: usize) -> Self {
        Self {
            client,
            prompts,
            concurrency: concurrency.max(1),
        }
    }

    /// Run one pass over `artifacts`.
    ///
    /// Each artifact is re-read from disk first, so the request carries what
    /// the build actually compiled. On success the file is replaced whole;
    /// on any failure it is not touched.
    pub async fn run(
        &self,
        artifacts: &[TestArtifact],
        build_log: &str,
        cancel: &CancellationToken,
    ) -> RefinementReport {
        info!(artifacts = artifacts.len(), "refine: starting");

        let build_log: Arc<str> = Arc::from(build_log);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for artifact in artifacts.iter().cloned() {
            let client = Arc::clone(&self.client);
            let prompts = Arc::clone(&self.prompts);
            let semaphore = Arc::clone(&semaphore);
            let build_log = Arc::clone(&build_log);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskOutcome::failed(&artifact.name, "cancelled", None),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(e) => return TaskOutcome::failed(&artifact.name, e.to_string(), None),
                    },
                };
                refine_one(&client, &prompts, &artifact, &build_log, &cancel).await
            });
        }

        let mut report = RefinementReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some((prompt, completion)) = outcome.tokens {
                        report.usage.record(prompt, completion);
                    }
                    match outcome.result {
                        Ok(artifact) => report.refined.push(artifact),
                        Err(failure) => report.unchanged.push(failure),
                    }
                }
                Err(e) => warn!(error = %e, "refine: artifact task aborted"),
            }
        }

        report.refined.sort_by(|a, b| a.name.cmp(&b.name));
        report.unchanged.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            refined = report.refined.len(),
            unchanged = report.unchanged.len(),
            "refine: complete"
        );
        report
    }
}

async fn refine_one(
    client: &CompletionClient,
    prompts: &PromptSet,
    artifact: &TestArtifact,
    build_log: &str,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let current = match artifact.reload().await {
        Ok(a) => a,
        Err(e) => {
            warn!(artifact = %artifact.name, error = %e, "refine: cannot read artifact");
            return TaskOutcome::failed(&artifact.name, format!("read failed: {e}"), None);
        }
    };

    let request = prompts.refinement_request(&current, build_log);
    let completion = match client.complete(&request, cancel).await {
        Ok(c) => c,
        Err(e) => {
            warn!(artifact = %artifact.name, error = %e, "refine: leaving artifact unchanged");
            return TaskOutcome::failed(&artifact.name, e.to_string(), None);
        }
    };
    let tokens = Some((completion.prompt_tokens, completion.completion_tokens));

    if cancel.is_cancelled() {
        return TaskOutcome::failed(&artifact.name, "cancelled", tokens);
    }

    match current.overwrite(completion.text).await {
        Ok(refined) => {
            debug!(
                artifact = %refined.name,
                latency_ms = completion.latency_ms,
                "refine: replaced artifact"
            );
            TaskOutcome {
                result: Ok(refined),
                tokens,
            }
        }
        Err(e) => {
            warn!(artifact = %artifact.name, error = %e, "refine: failed to write artifact");
            TaskOutcome::failed(&artifact.name, format!("write failed: {e}"), tokens)
        }
    }
}
