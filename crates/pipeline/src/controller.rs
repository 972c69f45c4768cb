use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use testloom_kernel::budget::RetryBudget;
use testloom_kernel::build::BuildTool;
use testloom_kernel::pipeline::{EventKind, LoopState, RunContext, RunResult, RunStatus, UnitFailure};
use testloom_router::client::CompletionClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifact::TestArtifact;
use crate::catalog::SourceUnit;
use crate::config::ResolvedConfig;
use crate::generate::GenerationStage;
use crate::history::{HistoryEntry, JsonlHistory};
use crate::refine::RefinementStage;

// ---------------------------------------------------------------------------
// LoopController
// ---------------------------------------------------------------------------

/// Drives Generating -> Building -> (Refining -> Building)* until the build
/// is clean or the refinement budget runs out.
pub struct LoopController {
    generation: GenerationStage,
    refinement: RefinementStage,
    build: Arc<dyn BuildTool>,
    max_passes: u32,
    history: Option<JsonlHistory>,
}

/// Counters and outputs accumulated while the loop runs.
#[derive(Default)]
struct Progress {
    build_invocations: u32,
    refinement_passes: u32,
    artifacts: Vec<PathBuf>,
    skipped: Vec<UnitFailure>,
    last_build_output: Option<String>,
}

impl LoopController {
    pub fn new(
        generation: GenerationStage,
        refinement: RefinementStage,
        build: Arc<dyn BuildTool>,
        max_passes: u32,
    ) -> Self {
        Self {
            generation,
            refinement,
            build,
            max_passes,
            history: None,
        }
    }

    /// Wire both stages from one resolved config and a shared client.
    pub fn from_config(
        config: &ResolvedConfig,
        client: Arc<CompletionClient>,
        build: Arc<dyn BuildTool>,
    ) -> Self {
        let prompts = Arc::new(config.prompts.clone());
        let generation = GenerationStage::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            config.naming.clone(),
            config.output_dir.clone(),
            config.concurrency,
        );
        let refinement = RefinementStage::new(client, prompts, config.concurrency);
        Self::new(generation, refinement, build, config.max_passes)
    }

    /// Record every finished run to `history`.
    pub fn with_history(mut self, history: JsonlHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Run the loop over `units`. Never panics or returns early with an
    /// error: every outcome, including failure to start the build, is folded
    /// into the returned `RunResult`.
    pub async fn run(&self, units: &[SourceUnit], cancel: &CancellationToken) -> RunResult {
        let run_id = format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S%.3f"));
        let mut ctx = RunContext::new(run_id);
        let mut progress = Progress::default();

        info!(run_id = %ctx.run_id, units = units.len(), build = %self.build.describe(), "run starting");

        let (status, error) = self.drive(&mut ctx, &mut progress, units, cancel).await;

        ctx.emit(
            EventKind::RunFinished,
            serde_json::json!({
                "status": status.to_string(),
                "build_invocations": progress.build_invocations,
                "refinement_passes": progress.refinement_passes,
            }),
        );

        let run_id = ctx.run_id.clone();
        let result = RunResult {
            status,
            build_invocations: progress.build_invocations,
            refinement_passes: progress.refinement_passes,
            artifacts: progress.artifacts,
            skipped_units: progress.skipped,
            usage: ctx.usage,
            last_build_output: progress.last_build_output,
            events: ctx.events,
            error,
        };

        if let Some(history) = &self.history {
            let entry = HistoryEntry::from_result(&run_id, self.generation.client().model(), &result);
            if let Err(e) = history.record(&entry).await {
                warn!(run_id = %run_id, error = %e, "failed to record history");
            }
        }

        info!(
            run_id = %run_id,
            status = %result.status,
            builds = result.build_invocations,
            passes = result.refinement_passes,
            "run complete"
        );
        result
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        progress: &mut Progress,
        units: &[SourceUnit],
        cancel: &CancellationToken,
    ) -> (RunStatus, Option<String>) {
        // --- Generating ---
        ctx.emit(
            EventKind::GenerationStarted,
            serde_json::json!({ "units": units.len() }),
        );
        let generated = match self.generation.run(units, cancel).await {
            Ok(r) => r,
            Err(e) => return (RunStatus::Error, Some(e.to_string())),
        };
        ctx.usage.merge(&generated.usage);
        for artifact in &generated.artifacts {
            ctx.emit(
                EventKind::ArtifactWritten,
                serde_json::json!({
                    "name": artifact.name,
                    "path": artifact.path.display().to_string(),
                }),
            );
        }
        for skipped in &generated.skipped {
            ctx.emit(
                EventKind::UnitSkipped,
                serde_json::json!({ "name": skipped.name, "reason": skipped.reason }),
            );
        }
        progress.artifacts = generated.artifacts.iter().map(|a| a.path.clone()).collect();
        progress.skipped = generated.skipped;
        let generated = generated.artifacts;

        if cancel.is_cancelled() {
            return (RunStatus::Cancelled, None);
        }

        let mut budget = RetryBudget::new(self.max_passes);
        ctx.transition(LoopState::Building);

        loop {
            // --- Building ---
            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (RunStatus::Cancelled, None),
                r = self.build.build() => r,
            };
            let report = match report {
                Ok(r) => r,
                Err(e) => return (RunStatus::Error, Some(e.to_string())),
            };
            progress.build_invocations += 1;
            ctx.emit(
                EventKind::BuildFinished,
                serde_json::json!({
                    "invocation": progress.build_invocations,
                    "succeeded": report.succeeded,
                    "exit_code": report.exit_code,
                    "duration_ms": report.duration_ms,
                }),
            );
            progress.last_build_output = Some(report.combined_output.clone());

            if report.succeeded {
                ctx.transition(LoopState::Done);
                return (RunStatus::Done, None);
            }

            let Some(pass) = budget.consume() else {
                ctx.transition(LoopState::BudgetExhausted);
                return (
                    RunStatus::BudgetExhausted,
                    Some(format!(
                        "build still failing after {} refinement pass(es)",
                        progress.refinement_passes
                    )),
                );
            };

            let artifacts = self.refinement_targets(units, &generated).await;
            if artifacts.is_empty() {
                ctx.transition(LoopState::BudgetExhausted);
                return (
                    RunStatus::BudgetExhausted,
                    Some("build failing and no test artifacts exist to refine".into()),
                );
            }

            // --- Refining ---
            ctx.transition(LoopState::Refining);
            ctx.emit(
                EventKind::RefinementStarted,
                serde_json::json!({ "pass": pass, "artifacts": artifacts.len() }),
            );
            info!(pass, remaining = budget.remaining(), "refine: pass starting");

            let refined = self
                .refinement
                .run(&artifacts, &report.combined_output, cancel)
                .await;
            ctx.usage.merge(&refined.usage);
            progress.refinement_passes += 1;

            for artifact in &refined.refined {
                ctx.emit(
                    EventKind::ArtifactRefined,
                    serde_json::json!({ "name": artifact.name, "pass": pass }),
                );
            }
            for unchanged in &refined.unchanged {
                ctx.emit(
                    EventKind::ArtifactUnchanged,
                    serde_json::json!({
                        "name": unchanged.name,
                        "pass": pass,
                        "reason": unchanged.reason,
                    }),
                );
            }

            if cancel.is_cancelled() {
                return (RunStatus::Cancelled, None);
            }
            ctx.transition(LoopState::Building);
        }
    }

    /// Every test file the build can see for a catalog unit, plus anything
    /// this run generated. Files left by earlier runs count even when this
    /// run's generation for the unit failed.
    async fn refinement_targets(
        &self,
        units: &[SourceUnit],
        generated: &[TestArtifact],
    ) -> Vec<TestArtifact> {
        let mut targets = self
            .generation
            .naming()
            .existing(self.generation.output_dir(), units)
            .await;
        for artifact in generated {
            if !targets.iter().any(|t| t.name == artifact.name) {
                targets.push(artifact.clone());
            }
        }
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }
}
