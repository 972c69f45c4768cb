use std::path::Path;

use anyhow::Result;
use testloom_pipeline::config::{
    ConfigOverrides, LOOM_DIR, LoomConfig, check_api_key, detect_build_command, process_env,
};

use super::common::load_config;

pub fn execute(project: &Path, config_path: Option<&Path>) -> Result<()> {
    println!("testloom status\n");

    let config = load_config(project, config_path, &ConfigOverrides::default())?;
    for line in describe(&config, project, check_api_key(&config, &process_env)) {
        println!("{line}");
    }
    Ok(())
}

fn describe(config: &LoomConfig, project: &Path, key_present: bool) -> Vec<String> {
    let mut lines = Vec::new();
    let key_state = if key_present { "available" } else { "missing" };
    lines.push(format!(
        "Credential:  {} ({key_state})",
        config.completion.api_key_env
    ));
    lines.push(format!("Endpoint:    {}", config.completion.endpoint));
    lines.push(format!(
        "Model:       {}",
        config
            .completion
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or("(not set)")
    ));
    lines.push(String::new());

    let source = config
        .catalog
        .source_dir
        .as_ref()
        .map(|d| project.join(d).display().to_string())
        .unwrap_or_else(|| "(not set)".into());
    lines.push(format!(
        "Sources:     {source} (*{} + *{})",
        config.catalog.definition_suffix, config.catalog.declaration_suffix
    ));
    lines.push(format!(
        "Output:      {} (*{})",
        project.join(&config.output.dir).display(),
        config.output.artifact_suffix
    ));
    lines.push(String::new());

    let build_dir = config
        .build
        .working_dir
        .as_ref()
        .map(|d| project.join(d))
        .unwrap_or_else(|| project.to_path_buf());
    let build = match &config.build.command {
        Some(cmd) if !cmd.trim().is_empty() => cmd.clone(),
        _ => match detect_build_command(&build_dir) {
            Some(cmd) => format!("{cmd} (detected)"),
            None => "(not set, none detected)".into(),
        },
    };
    let policy = &config.build.diagnostics;
    lines.push(format!("Build:       {build}"));
    lines.push(format!(
        "Diagnostics: marker {:?}, case {}, exit status {:?}",
        policy.marker,
        if policy.case_sensitive { "sensitive" } else { "insensitive" },
        policy.exit_status
    ));
    lines.push(format!(
        "Limits:      {} refinement pass(es), concurrency {}",
        config.limits.max_passes,
        config
            .limits
            .concurrency
            .map(|n| n.to_string())
            .unwrap_or_else(|| "auto".into())
    ));
    lines.push(String::new());

    if project.join(LOOM_DIR).exists() {
        lines.push("Initialized: yes".into());
    } else {
        lines.push("Initialized: no (run `testloom init`)".into());
    }
    lines
}
