use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use testloom_kernel::budget::UsageRecord;
use testloom_kernel::error::Result;
use testloom_kernel::pipeline::UnitFailure;
use testloom_router::client::CompletionClient;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactNaming, TestArtifact};
use crate::catalog::SourceUnit;
use crate::prompts::PromptSet;

/// What one generation pass produced.
#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Artifacts written this pass, sorted by name.
    pub artifacts: Vec<TestArtifact>,
    /// Units with no artifact, sorted by name.
    pub skipped: Vec<UnitFailure>,
    pub usage: UsageRecord,
}

/// Result of a single unit or artifact task, shared with refinement.
pub(crate) struct TaskOutcome {
    pub result: std::result::Result<TestArtifact, UnitFailure>,
    /// Prompt and completion tokens, when the service answered.
    pub tokens: Option<(u64, u64)>,
}

impl TaskOutcome {
    pub(crate) fn failed(name: &str, reason: impl Into<String>, tokens: Option<(u64, u64)>) -> Self {
        Self {
            result: Err(UnitFailure {
                name: name.to_string(),
                reason: reason.into(),
            }),
            tokens,
        }
    }
}

/// Produces one draft artifact per source unit, all units in parallel.
pub struct GenerationStage {
    client: Arc<CompletionClient>,
    prompts: Arc<PromptSet>,
    naming: ArtifactNaming,
    output_dir: PathBuf,
    concurrency: usize,
}

impl GenerationStage {
    pub fn new(
        client: Arc<CompletionClient>,
        prompts: Arc<PromptSet>,
        naming: ArtifactNaming,
        output_dir: PathBuf,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            prompts,
            naming,
            output_dir,
            concurrency: concurrency.max(1),
        }
    }

    pub fn client(&self) -> &CompletionClient {
        &self.client
    }

    pub fn naming(&self) -> &ArtifactNaming {
        &self.naming
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Generate an artifact for every unit.
    ///
    /// Fails only on a naming collision or when the output directory cannot
    /// be created. A unit whose completion fails gets no file; the stage
    /// still waits for every other unit.
    pub async fn run(
        &self,
        units: &[SourceUnit],
        cancel: &CancellationToken,
    ) -> Result<GenerationReport> {
        self.naming.check_collisions(units)?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        info!(
            units = units.len(),
            dir = %self.output_dir.display(),
            concurrency = self.concurrency,
            "generate: starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for unit in units.iter().cloned() {
            let client = Arc::clone(&self.client);
            let prompts = Arc::clone(&self.prompts);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let path = self.naming.path_for(&self.output_dir, &unit.name);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskOutcome::failed(&unit.name, "cancelled", None),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(e) => return TaskOutcome::failed(&unit.name, e.to_string(), None),
                    },
                };
                generate_one(&client, &prompts, &unit, path, &cancel).await
            });
        }

        let mut report = GenerationReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some((prompt, completion)) = outcome.tokens {
                        report.usage.record(prompt, completion);
                    }
                    match outcome.result {
                        Ok(artifact) => report.artifacts.push(artifact),
                        Err(failure) => report.skipped.push(failure),
                    }
                }
                Err(e) => warn!(error = %e, "generate: unit task aborted"),
            }
        }

        // A task that panicked reported nothing; account for it by name.
        let accounted: BTreeSet<&str> = report
            .artifacts
            .iter()
            .map(|a| a.name.as_str())
            .chain(report.skipped.iter().map(|s| s.name.as_str()))
            .collect();
        let lost: Vec<UnitFailure> = units
            .iter()
            .filter(|u| !accounted.contains(u.name.as_str()))
            .map(|u| UnitFailure {
                name: u.name.clone(),
                reason: "generation task aborted".into(),
            })
            .collect();
        report.skipped.extend(lost);

        report.artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        report.skipped.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            written = report.artifacts.len(),
            skipped = report.skipped.len(),
            "generate: complete"
        );
        Ok(report)
    }
}

async fn generate_one(
    client: &CompletionClient,
    prompts: &PromptSet,
    unit: &SourceUnit,
    path: PathBuf,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let request = prompts.generation_request(unit);

    let completion = match client.complete(&request, cancel).await {
        Ok(c) => c,
        Err(e) => {
            warn!(unit = %unit.name, error = %e, "generate: skipping unit");
            return TaskOutcome::failed(&unit.name, e.to_string(), None);
        }
    };
    let tokens = Some((completion.prompt_tokens, completion.completion_tokens));

    if cancel.is_cancelled() {
        return TaskOutcome::failed(&unit.name, "cancelled", tokens);
    }

    match TestArtifact::write(&unit.name, path, completion.text).await {
        Ok(artifact) => {
            debug!(
                unit = %unit.name,
                artifact = %artifact.path.display(),
                latency_ms = completion.latency_ms,
                "generate: wrote artifact"
            );
            TaskOutcome {
                result: Ok(artifact),
                tokens,
            }
        }
        Err(e) => {
            warn!(unit = %unit.name, error = %e, "generate: failed to write artifact");
            TaskOutcome::failed(&unit.name, format!("write failed: {e}"), tokens)
        }
    }
}
