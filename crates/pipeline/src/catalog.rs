use std::path::{Path, PathBuf};

use testloom_kernel::error::{Error, Result};
use testloom_kernel::pipeline::UnitFailure;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// SourceUnit
// ---------------------------------------------------------------------------

/// A declaration/definition pair that needs tests. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Base name shared by both files (e.g. `AuthController`).
    pub name: String,
    pub declaration_text: String,
    pub definition_text: String,
    pub definition_path: PathBuf,
}

/// Result of scanning the source directory.
#[derive(Debug, Default)]
pub struct CatalogScan {
    /// Units in file-name order.
    pub units: Vec<SourceUnit>,
    /// Definition files that could not be read.
    pub skipped: Vec<UnitFailure>,
}

// ---------------------------------------------------------------------------
// SourceCatalog
// ---------------------------------------------------------------------------

/// Discovers definition files in one directory and pairs each with the
/// declaration file of the same base name.
#[derive(Debug, Clone)]
pub struct SourceCatalog {
    dir: PathBuf,
    definition_suffix: String,
    declaration_suffix: String,
}

impl SourceCatalog {
    pub fn new(
        dir: impl Into<PathBuf>,
        definition_suffix: impl Into<String>,
        declaration_suffix: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            definition_suffix: definition_suffix.into(),
            declaration_suffix: declaration_suffix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enumerate and read every unit.
    ///
    /// A missing declaration file reads as empty text. A definition file
    /// that cannot be read is skipped and reported. Only a missing or
    /// unreadable directory fails the scan.
    pub fn scan(&self) -> Result<CatalogScan> {
        if !self.dir.is_dir() {
            return Err(Error::Config(format!(
                "source directory not found: {}",
                self.dir.display()
            )));
        }

        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            glob::Pattern::escape(&self.definition_suffix)
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("invalid source pattern `{pattern}`: {e}")))?;

        let mut paths: Vec<PathBuf> = Vec::new();
        let mut scan = CatalogScan::default();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %e.path().display(), error = %e.error(), "catalog: unreadable entry");
                    scan.skipped.push(UnitFailure {
                        name: e.path().display().to_string(),
                        reason: e.error().to_string(),
                    });
                }
            }
        }
        paths.sort();

        for path in paths {
            let Some(name) = self.unit_name(&path) else {
                continue;
            };
            match self.read_unit(&name, &path) {
                Ok(unit) => scan.units.push(unit),
                Err(e) => {
                    warn!(unit = %name, error = %e, "catalog: skipping unit");
                    scan.skipped.push(UnitFailure {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            dir = %self.dir.display(),
            units = scan.units.len(),
            skipped = scan.skipped.len(),
            "catalog: scan complete"
        );
        Ok(scan)
    }

    fn unit_name(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        let name = file_name.strip_suffix(self.definition_suffix.as_str())?;
        (!name.is_empty()).then(|| name.to_string())
    }

    fn read_unit(&self, name: &str, definition_path: &Path) -> std::io::Result<SourceUnit> {
        let definition_text = std::fs::read_to_string(definition_path)?;

        let declaration_path = self
            .dir
            .join(format!("{name}{}", self.declaration_suffix));
        let declaration_text = match std::fs::read_to_string(&declaration_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(unit = %name, path = %declaration_path.display(), "catalog: no declaration file, using empty text");
                String::new()
            }
            Err(e) => return Err(e),
        };

        debug!(unit = %name, "catalog: read unit");
        Ok(SourceUnit {
            name: name.to_string(),
            declaration_text,
            definition_text,
            definition_path: definition_path.to_path_buf(),
        })
    }
}
