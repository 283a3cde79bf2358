use thiserror::Error;

/// Errors returned by the job engine.
///
/// A job that is canceled or fails is *not* an error: its outcome is carried
/// by [`JobStatus`](crate::JobStatus). These variants cover API misuse,
/// waits aborted through a progress monitor, and engine lifecycle problems.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("invalid scheduling rule: {0}")]
    InvalidRule(String),

    #[error("job manager has been shut down")]
    ShutDown,

    #[error("operation canceled")]
    Canceled,

    #[error("lock graph corrupted: {0}")]
    GraphCorrupted(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JobsError>;
