use std::path::Path;

use anyhow::Result;
use testloom_pipeline::history::JsonlHistory;

pub async fn execute(project: &Path, count: usize) -> Result<()> {
    let history = JsonlHistory::new(project);
    let entries = history.recent(count).await?;
    if entries.is_empty() {
        println!("No run history found.");
        return Ok(());
    }

    println!("testloom history (last {count})\n");
    for entry in &entries {
        print!(
            "  {} | {} | {} | {} build(s), {} pass(es) | {} artifact(s) | {} tokens",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.run_id,
            entry.status,
            entry.build_invocations,
            entry.refinement_passes,
            entry.artifacts,
            entry.usage.total_tokens
        );
        if let Some(err) = &entry.error {
            print!(" | error: {err}");
        }
        println!();
    }

    Ok(())
}
