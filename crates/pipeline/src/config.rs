use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testloom_kernel::build::{DiagnosticPolicy, ShellBuild};
use testloom_kernel::budget::RetryBudget;
use testloom_kernel::error::{Error, Result};
use testloom_router::client::ClientSettings;
use testloom_router::provider::CompletionParams;
use testloom_router::provider::openai::{OPENROUTER_API_URL, OpenAiProvider};

use crate::artifact::ArtifactNaming;
use crate::prompts::{PromptSet, PromptsConfig};

/// Directory (relative to the project root) holding config and logs.
pub const LOOM_DIR: &str = ".testloom";

/// Environment variable overrides, applied after the YAML file.
pub const ENV_MODEL: &str = "TESTLOOM_MODEL";
pub const ENV_ENDPOINT: &str = "TESTLOOM_ENDPOINT";
pub const ENV_SOURCE_DIR: &str = "TESTLOOM_SOURCE_DIR";
pub const ENV_OUTPUT_DIR: &str = "TESTLOOM_OUTPUT_DIR";
pub const ENV_BUILD_COMMAND: &str = "TESTLOOM_BUILD_COMMAND";

/// Full testloom configuration, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoomConfig {
    pub completion: CompletionConfig,
    pub catalog: CatalogConfig,
    pub output: OutputConfig,
    pub build: BuildConfig,
    pub limits: LimitsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Extra headers sent with every request (e.g. `HTTP-Referer`).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    pub definition_suffix: String,
    pub declaration_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub artifact_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub command: Option<String>,
    /// Where the build runs. Defaults to the project root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub diagnostics: DiagnosticPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_passes: u32,
    /// Concurrent requests per stage. `None` means available parallelism.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            completion: CompletionConfig {
                endpoint: OPENROUTER_API_URL.into(),
                model: None,
                api_key_env: "OPENROUTER_API_KEY".into(),
                headers: BTreeMap::from([("X-Title".into(), "testloom".into())]),
                timeout_secs: 300,
                max_attempts: 3,
                temperature: None,
                max_tokens: None,
            },
            catalog: CatalogConfig {
                source_dir: None,
                definition_suffix: ".cc".into(),
                declaration_suffix: ".h".into(),
            },
            output: OutputConfig {
                dir: PathBuf::from("test"),
                artifact_suffix: "_test.cc".into(),
            },
            build: BuildConfig {
                command: None,
                working_dir: None,
                timeout_secs: 1800,
                diagnostics: DiagnosticPolicy::default(),
            },
            limits: LimitsConfig {
                max_passes: RetryBudget::DEFAULT_PASSES,
                concurrency: None,
            },
            prompts: PromptsConfig::default(),
        }
    }
}

/// Flag-level overrides, the highest-precedence layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub max_passes: Option<u32>,
    pub build_command: Option<String>,
    pub concurrency: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut LoomConfig) {
        if let Some(model) = &self.model {
            config.completion.model = Some(model.clone());
        }
        if let Some(passes) = self.max_passes {
            config.limits.max_passes = passes;
        }
        if let Some(cmd) = &self.build_command {
            config.build.command = Some(cmd.clone());
        }
        if let Some(n) = self.concurrency {
            config.limits.concurrency = Some(n);
        }
    }
}

/// Environment lookup used during loading. Injected so tests never touch the
/// process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Reads from the process environment, treating empty values as unset.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl LoomConfig {
    /// Path of the project-local config file.
    pub fn default_path(project: &Path) -> PathBuf {
        project.join(LOOM_DIR).join("config.yaml")
    }

    /// Load config: built-in defaults, deep-merged with the YAML file, then
    /// environment overrides.
    ///
    /// `explicit` names a config file that must exist; otherwise the project
    /// file is used when present.
    pub fn load(project: &Path, explicit: Option<&Path>, env: EnvLookup<'_>) -> Result<Self> {
        let mut config = Self::default();

        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => Some(Self::default_path(project)).filter(|p| p.exists()),
        };

        if let Some(path) = path {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;

            // A file with only comments parses to Null.
            let overrides: serde_yaml::Value = serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid config YAML: {e}")))?;

            if !overrides.is_null() {
                let base: serde_yaml::Value = serde_yaml::to_value(&config)
                    .map_err(|e| Error::Config(format!("failed to serialize defaults: {e}")))?;

                let merged = deep_merge(base, overrides);
                config = serde_yaml::from_value(merged)
                    .map_err(|e| Error::Config(format!("failed to parse merged config: {e}")))?;
            }
        }

        config.apply_env(env);
        Ok(config)
    }

    fn apply_env(&mut self, env: EnvLookup<'_>) {
        if let Some(v) = env(ENV_MODEL) {
            self.completion.model = Some(v);
        }
        if let Some(v) = env(ENV_ENDPOINT) {
            self.completion.endpoint = v;
        }
        if let Some(v) = env(ENV_SOURCE_DIR) {
            self.catalog.source_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env(ENV_OUTPUT_DIR) {
            self.output.dir = PathBuf::from(v);
        }
        if let Some(v) = env(ENV_BUILD_COMMAND) {
            self.build.command = Some(v);
        }
    }

    /// Validate and freeze the configuration for one run.
    ///
    /// Relative directories are resolved against `project`. Fails with
    /// `ConfigMissing` when the credential, model, source directory, or a
    /// usable build command is absent.
    pub fn resolve(&self, project: &Path, env: EnvLookup<'_>) -> Result<ResolvedConfig> {
        let api_key = env(&self.completion.api_key_env)
            .ok_or_else(|| Error::config_missing(self.completion.api_key_env.clone()))?;

        let model = self
            .completion
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::config_missing("completion.model"))?;

        let source_dir = self
            .catalog
            .source_dir
            .as_ref()
            .map(|d| project.join(d))
            .ok_or_else(|| Error::config_missing("catalog.source_dir"))?;

        let build_dir = self
            .build
            .working_dir
            .as_ref()
            .map(|d| project.join(d))
            .unwrap_or_else(|| project.to_path_buf());

        let build_command = match self.build.command.clone().filter(|c| !c.trim().is_empty()) {
            Some(cmd) => cmd,
            None => detect_build_command(&build_dir)
                .ok_or_else(|| Error::config_missing("build.command"))?,
        };

        if self.output.artifact_suffix.is_empty() {
            return Err(Error::Config("output.artifact_suffix must not be empty".into()));
        }

        // Artifacts written beside the sources would be scanned as new units
        // on the next run.
        let output_dir = project.join(&self.output.dir);
        if output_dir.components().eq(source_dir.components())
            && self
                .output
                .artifact_suffix
                .ends_with(&self.catalog.definition_suffix)
        {
            return Err(Error::Config(format!(
                "output.dir `{}` is the source directory and `*{}` artifacts would be read back as sources",
                self.output.dir.display(),
                self.output.artifact_suffix
            )));
        }

        Ok(ResolvedConfig {
            project_dir: project.to_path_buf(),
            api_key,
            endpoint: self.completion.endpoint.clone(),
            model,
            headers: self.completion.headers.clone(),
            request_timeout: Duration::from_secs(self.completion.timeout_secs),
            max_attempts: self.completion.max_attempts.max(1),
            params: CompletionParams {
                temperature: self.completion.temperature,
                max_tokens: self.completion.max_tokens,
            },
            source_dir,
            definition_suffix: self.catalog.definition_suffix.clone(),
            declaration_suffix: self.catalog.declaration_suffix.clone(),
            output_dir,
            naming: ArtifactNaming::new(self.output.artifact_suffix.clone()),
            build_command,
            build_dir,
            build_timeout: Duration::from_secs(self.build.timeout_secs),
            diagnostics: self.build.diagnostics.clone(),
            max_passes: self.limits.max_passes,
            concurrency: self
                .limits
                .concurrency
                .unwrap_or_else(default_concurrency)
                .max(1),
            prompts: self.prompts.resolve(),
        })
    }
}

/// Validated, immutable configuration for a single run. Constructed once at
/// startup and passed by reference to every component.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub project_dir: PathBuf,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub headers: BTreeMap<String, String>,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub params: CompletionParams,
    pub source_dir: PathBuf,
    pub definition_suffix: String,
    pub declaration_suffix: String,
    pub output_dir: PathBuf,
    pub naming: ArtifactNaming,
    pub build_command: String,
    pub build_dir: PathBuf,
    pub build_timeout: Duration,
    pub diagnostics: DiagnosticPolicy,
    pub max_passes: u32,
    pub concurrency: usize,
    pub prompts: PromptSet,
}

impl std::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("project_dir", &self.project_dir)
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("source_dir", &self.source_dir)
            .field("output_dir", &self.output_dir)
            .field("build_command", &self.build_command)
            .field("max_passes", &self.max_passes)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl ResolvedConfig {
    pub fn provider(&self) -> OpenAiProvider {
        OpenAiProvider::new(self.api_key.clone(), self.endpoint.clone())
            .with_headers(self.headers.clone())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            params: self.params,
            timeout: self.request_timeout,
            max_attempts: self.max_attempts,
            ..ClientSettings::new(self.model.clone())
        }
    }

    pub fn shell_build(&self) -> ShellBuild {
        ShellBuild::new(
            self.build_command.clone(),
            self.build_dir.clone(),
            self.build_timeout,
            self.diagnostics.clone(),
        )
    }
}

/// Recursively merge override into base (override wins on conflict).
fn deep_merge(base: serde_yaml::Value, over: serde_yaml::Value) -> serde_yaml::Value {
    match (base, over) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(over_map)) => {
            for (key, over_val) in over_map {
                let merged = if let Some(base_val) = base_map.remove(&key) {
                    deep_merge(base_val, over_val)
                } else {
                    over_val
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, over) => over,
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Whether the credential variable named by the config is set.
pub fn check_api_key(config: &LoomConfig, env: EnvLookup<'_>) -> bool {
    env(&config.completion.api_key_env).is_some()
}

/// Auto-detect a build command for a C/C++ project.
pub fn detect_build_command(dir: &Path) -> Option<String> {
    if dir.join("CMakeLists.txt").exists() {
        Some("cmake -S . -B build && cmake --build build".into())
    } else if dir.join("meson.build").exists() {
        Some("(test -d build || meson setup build) && meson compile -C build".into())
    } else if dir.join("Makefile").exists() {
        Some("make".into())
    } else {
        None
    }
}

/// Commented template written by `testloom init`.
pub const CONFIG_TEMPLATE: &str = r#"# testloom configuration
#
# The API key is never stored here. Export the variable named by
# completion.api_key_env instead.

completion:
  # endpoint: https://openrouter.ai/api/v1/chat/completions
  model: ""
  # api_key_env: OPENROUTER_API_KEY
  # headers:
  #   HTTP-Referer: https://example.com/my-project
  # timeout_secs: 300
  # max_attempts: 3

catalog:
  source_dir: src
  # definition_suffix: .cc
  # declaration_suffix: .h

# output:
#   dir: test
#   artifact_suffix: _test.cc

# build:
#   command: cmake -S . -B build && cmake --build build
#   timeout_secs: 1800
#   diagnostics:
#     marker: "error:"
#     case_sensitive: true
#     exit_status: ignore   # or: fail

# limits:
#   max_passes: 1
#   concurrency: 8
"#;
