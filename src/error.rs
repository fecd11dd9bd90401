use std::path::PathBuf;
use std::process::ExitCode;

/// All errors that can occur in the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("manifest file not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("failed to parse manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid manifest: {0}")]
    ManifestValidation(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("failed to spawn task {task}: {source}")]
    SpawnFailed {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("working directory does not exist: {0}")]
    InvalidWorkDir(PathBuf),

    #[error("failed to register watch directory {path}: {source}")]
    WatchInit {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to the process exit code defined by the CLI contract.
    ///
    /// Errors that never reach the core (manifest loading) get their own
    /// dedicated codes; anything else is an execution-time failure.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ManifestNotFound(_) => ExitCode::from(2),
            Error::ManifestParse { .. } | Error::ManifestValidation(_) => ExitCode::from(3),
            _ => ExitCode::from(1),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
