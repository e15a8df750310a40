use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a generation request.
///
/// Per-line decode failures never show up here; backends log and skip them.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The operator has to edit a config file before anything can run.
    #[error("default config created at {}, please edit it and try again", path.display())]
    SetupRequired { path: PathBuf },

    #[error("{0}")]
    MissingCredentials(String),

    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to serialize request body: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The backend reported a failure inside an otherwise healthy stream.
    #[error("{0}")]
    Backend(String),
}

impl GenerateError {
    /// Errors the user fixes by editing config or environment, not by retrying.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            GenerateError::SetupRequired { .. }
                | GenerateError::MissingCredentials(_)
                | GenerateError::ConfigParse { .. }
                | GenerateError::InvalidConfig(_)
        )
    }
}
