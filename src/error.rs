use std::path::PathBuf;

/// Errors surfaced by the engine.
///
/// Only the startup family (`ScriptRead`, `Script` during the config probe,
/// `Config`, `Pool`) aborts a run with a non-zero exit code. Everything that
/// happens after ramp-up starts is degraded in place: per-iteration script
/// errors are logged and the virtual user continues, and queue-full events
/// drop the record.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read script {path}: {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script error: {0}")]
    Script(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid duration {0:?} (expected forms like \"500ms\", \"30s\", \"2m\")")]
    Duration(String),

    #[error("runtime pool error: {0}")]
    Pool(String),

    #[error("internal task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rquickjs::Error> for Error {
    fn from(err: rquickjs::Error) -> Self {
        Error::Script(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
