use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("entry corrupt: {0}")]
    EntryCorrupt(String),

    #[error("target location not set")]
    LocationUnset,

    #[error("unknown filesystem type: {0}")]
    UnknownFilesystem(String),

    #[error("refusing to run while a backup is in progress: {0}")]
    RunningRunConflict(String),

    #[error("compare mismatch: {0}")]
    CompareMismatch(String),

    #[error("path component is not a directory: {0}")]
    PartialPathIsFile(String),

    #[error("hard links unsupported: {0}")]
    LinkUnsupported(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("bad filter pattern: {0}")]
    BadPattern(String),
}
