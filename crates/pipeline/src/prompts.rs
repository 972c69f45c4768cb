use serde::{Deserialize, Serialize};
use testloom_kernel::message::CompletionRequest;

use crate::artifact::TestArtifact;
use crate::catalog::SourceUnit;

pub const DECLARATION_PLACEHOLDER: &str = "<<INCLUDE_HEADER>>";
pub const DEFINITION_PLACEHOLDER: &str = "<<INCLUDE_SOURCE>>";
pub const ARTIFACT_PLACEHOLDER: &str = "<<TEST_SOURCE>>";
pub const BUILD_LOG_PLACEHOLDER: &str = "<<BUILD_LOG>>";

const GENERATE_SYSTEM: &str = "You are a C++ unit test generator. Output only valid raw C++ \
GoogleTest code. No markdown, no text, no comments, no tags. Only C++ code.";

const GENERATE_TEMPLATE: &str = "Generate GoogleTest unit tests for the following C++ code.
Cover all public classes/functions, no duplicates, include headers, use TEST/TEST_F.
Source header:
<<INCLUDE_HEADER>>
Source file:
<<INCLUDE_SOURCE>>";

const REFINE_SYSTEM: &str = "You are a C++ unit test fixer. Output only the corrected raw C++ \
GoogleTest code. No markdown, no text, no comments, no tags. Only C++ code.";

const REFINE_TEMPLATE: &str = "The following GoogleTest file failed to build.
Fix only the build errors. Keep every passing test as it is and add no commentary.
Test file:
<<TEST_SOURCE>>
Build log:
<<BUILD_LOG>>";

/// Optional prompt overrides from config. Unset fields use the built-ins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub generate_system: Option<String>,
    #[serde(default)]
    pub generate_template: Option<String>,
    #[serde(default)]
    pub refine_system: Option<String>,
    #[serde(default)]
    pub refine_template: Option<String>,
}

impl PromptsConfig {
    pub fn resolve(&self) -> PromptSet {
        let defaults = PromptSet::default();
        PromptSet {
            generate_system: self
                .generate_system
                .clone()
                .unwrap_or(defaults.generate_system),
            generate_template: self
                .generate_template
                .clone()
                .unwrap_or(defaults.generate_template),
            refine_system: self.refine_system.clone().unwrap_or(defaults.refine_system),
            refine_template: self
                .refine_template
                .clone()
                .unwrap_or(defaults.refine_template),
        }
    }
}

/// The prompt text used by both stages. Contents are opaque to the
/// pipeline; only the placeholders are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub generate_system: String,
    pub generate_template: String,
    pub refine_system: String,
    pub refine_template: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            generate_system: GENERATE_SYSTEM.into(),
            generate_template: GENERATE_TEMPLATE.into(),
            refine_system: REFINE_SYSTEM.into(),
            refine_template: REFINE_TEMPLATE.into(),
        }
    }
}

impl PromptSet {
    pub fn generation_request(&self, unit: &SourceUnit) -> CompletionRequest {
        CompletionRequest::new(
            self.generate_system.clone(),
            substitute(
                &self.generate_template,
                &[
                    (DECLARATION_PLACEHOLDER, &unit.declaration_text),
                    (DEFINITION_PLACEHOLDER, &unit.definition_text),
                ],
            ),
        )
    }

    pub fn refinement_request(&self, artifact: &TestArtifact, build_log: &str) -> CompletionRequest {
        CompletionRequest::new(
            self.refine_system.clone(),
            substitute(
                &self.refine_template,
                &[
                    (ARTIFACT_PLACEHOLDER, &artifact.content),
                    (BUILD_LOG_PLACEHOLDER, build_log),
                ],
            ),
        )
    }
}

/// Replace placeholders in one left-to-right pass. Substituted text is never
/// rescanned, so a source file that happens to contain a placeholder is
/// passed through verbatim.
fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = values
            .iter()
            .filter_map(|(key, value)| rest.find(key).map(|pos| (pos, *key, *value)))
            .min_by_key(|(pos, _, _)| *pos);
        match next {
            Some((pos, key, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + key.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}
