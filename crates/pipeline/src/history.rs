use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testloom_kernel::budget::UsageRecord;
use testloom_kernel::error::Result;
use testloom_kernel::pipeline::{RunResult, RunStatus};
use tokio::io::AsyncWriteExt;

use crate::config::LOOM_DIR;

// ---------------------------------------------------------------------------
// HistoryEntry — what gets stored per run
// ---------------------------------------------------------------------------

/// One run, appended to `history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub status: RunStatus,
    pub model: String,
    pub build_invocations: u32,
    pub refinement_passes: u32,
    pub artifacts: usize,
    pub skipped_units: usize,
    #[serde(default)]
    pub usage: UsageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn from_result(run_id: &str, model: &str, result: &RunResult) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            status: result.status,
            model: model.into(),
            build_invocations: result.build_invocations,
            refinement_passes: result.refinement_passes,
            artifacts: result.artifacts.len(),
            skipped_units: result.skipped_units.len(),
            usage: result.usage.clone(),
            error: result.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// JsonlHistory — append-only run log
// ---------------------------------------------------------------------------

/// Append-only JSONL run history under `<project>/.testloom/logs/`.
#[derive(Debug, Clone)]
pub struct JsonlHistory {
    history_file: PathBuf,
}

impl JsonlHistory {
    pub fn new(project: &Path) -> Self {
        Self {
            history_file: project.join(LOOM_DIR).join("logs").join("history.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.history_file
    }

    pub async fn record(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.history_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Most recent entries first, at most `limit`.
    pub async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let entries = self.read_all().await?;
        Ok(entries.into_iter().rev().take(limit).collect())
    }

    /// Read every entry, skipping malformed lines.
    async fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        if !self.history_file.exists() {
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read_to_string(&self.history_file).await?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed history line");
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn temp_history() -> (tempfile::TempDir, JsonlHistory) {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonlHistory::new(dir.path());
        (dir, history)
    }

    fn sample_entry(run_id: &str, status: RunStatus) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 4, 9, 15, 0).unwrap(),
            run_id: run_id.into(),
            status,
            model: "deepseek/deepseek-r1".into(),
            build_invocations: 2,
            refinement_passes: 1,
            artifacts: 4,
            skipped_units: 0,
            usage: UsageRecord {
                prompt_tokens: 800,
                completion_tokens: 400,
                total_tokens: 1200,
                call_count: 8,
            },
            error: None,
        }
    }

    #[tokio::test]
    async fn record_and_read_most_recent_first() {
        let (_dir, history) = temp_history();
        history.record(&sample_entry("run-1", RunStatus::Done)).await.unwrap();
        history
            .record(&sample_entry("run-2", RunStatus::BudgetExhausted))
            .await
            .unwrap();

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "run-2");
        assert_eq!(recent[0].status, RunStatus::BudgetExhausted);
        assert_eq!(recent[1].usage.total_tokens, 1200);
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let (_dir, history) = temp_history();
        for i in 0..5 {
            history
                .record(&sample_entry(&format!("run-{i}"), RunStatus::Done))
                .await
                .unwrap();
        }
        let recent = history.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "run-4");
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let (_dir, history) = temp_history();
        assert!(history.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_skipped() {
        let (_dir, history) = temp_history();
        history.record(&sample_entry("run-1", RunStatus::Done)).await.unwrap();
        {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(history.path())
                .unwrap();
            writeln!(f, "{{not json").unwrap();
            writeln!(f).unwrap();
        }
        history.record(&sample_entry("run-2", RunStatus::Done)).await.unwrap();

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn history_lives_under_loom_dir() {
        let history = JsonlHistory::new(Path::new("/proj"));
        assert_eq!(
            history.path(),
            Path::new("/proj/.testloom/logs/history.jsonl")
        );
    }
}
