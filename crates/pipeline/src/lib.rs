pub mod artifact;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod generate;
pub mod history;
pub mod prompts;
pub mod refine;

pub use artifact::{ArtifactNaming, TestArtifact};
pub use catalog::{CatalogScan, SourceCatalog, SourceUnit};
pub use config::{ConfigOverrides, LoomConfig, ResolvedConfig};
pub use controller::LoopController;
pub use generate::{GenerationReport, GenerationStage};
pub use history::{HistoryEntry, JsonlHistory};
pub use prompts::PromptSet;
pub use refine::{RefinementReport, RefinementStage};
