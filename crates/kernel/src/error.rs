/// Run-level error type.
///
/// Failures scoped to a single unit or artifact (transport errors, empty
/// completions, unreadable files) are not represented here. Stages record
/// those as values and keep going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required configuration `{key}`")]
    ConfigMissing { key: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("artifact name collision: {units:?} all map to `{file_name}`")]
    NameCollision {
        file_name: String,
        units: Vec<String>,
    },

    #[error("build failed to run: {reason}")]
    Build { reason: String },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config_missing(key: impl Into<String>) -> Self {
        Self::ConfigMissing { key: key.into() }
    }
}
