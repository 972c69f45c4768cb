use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use testloom_kernel::error::{Error, Result};

use crate::catalog::SourceUnit;

/// Maps unit names to artifact file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNaming {
    suffix: String,
}

impl ArtifactNaming {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// `AuthController` becomes `AuthController_test.cc`.
    pub fn file_name(&self, unit_name: &str) -> String {
        format!("{unit_name}{}", self.suffix)
    }

    pub fn path_for(&self, output_dir: &Path, unit_name: &str) -> PathBuf {
        output_dir.join(self.file_name(unit_name))
    }

    /// Reject unit sets where two names land on the same artifact file.
    ///
    /// File names are compared lowercased, since `Foo_test.cc` and
    /// `foo_test.cc` are the same file on case-insensitive filesystems.
    /// Concurrent writers in a stage rely on every path being distinct.
    pub fn check_collisions(&self, units: &[SourceUnit]) -> Result<()> {
        let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for unit in units {
            seen.entry(self.file_name(&unit.name).to_lowercase())
                .or_default()
                .push(unit.name.clone());
        }

        match seen.into_iter().find(|(_, names)| names.len() > 1) {
            Some((file_name, units)) => Err(Error::NameCollision { file_name, units }),
            None => Ok(()),
        }
    }

    /// Artifacts for `units` that currently exist in `output_dir`, whether
    /// or not this run wrote them. Sorted by unit name.
    pub async fn existing(&self, output_dir: &Path, units: &[SourceUnit]) -> Vec<TestArtifact> {
        let mut found = Vec::new();
        for unit in units {
            let path = self.path_for(output_dir, &unit.name);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => found.push(TestArtifact {
                    name: unit.name.clone(),
                    path,
                    content,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read existing artifact");
                }
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}

/// A generated test file.
///
/// Identity is `name` and `path`, fixed at generation. `content` is what was
/// last written; refinement replaces it whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestArtifact {
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

impl TestArtifact {
    /// Write `content` to `path`, replacing any existing file.
    pub async fn write(name: &str, path: PathBuf, content: String) -> std::io::Result<Self> {
        tokio::fs::write(&path, content.as_bytes()).await?;
        Ok(Self {
            name: name.to_string(),
            path,
            content,
        })
    }

    /// Re-read the artifact from disk.
    pub async fn reload(&self) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(Self {
            name: self.name.clone(),
            path: self.path.clone(),
            content,
        })
    }

    /// Replace the on-disk content, keeping name and path.
    pub async fn overwrite(&self, content: String) -> std::io::Result<Self> {
        Self::write(&self.name, self.path.clone(), content).await
    }
}
