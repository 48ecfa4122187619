/// Core error type for weft
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    /// Transient failure in an external collaborator (executor, messenger,
    /// network). The scheduler retries these with backoff.
    #[error("External error: {0}")]
    External(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The execution suspended awaiting an approval decision. Not a failure:
    /// the job is marked done and a fresh job resumes the execution later.
    #[error("Execution suspended awaiting approval")]
    Suspended,

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the scheduler may requeue the job after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::External(_) | Error::Io(_))
    }

    /// Terminal errors are surfaced to the triggering user and never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::NotFound(_) | Error::Permission(_) | Error::Cancelled
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("JSON error: {}", err))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::External("executor 503".into()).is_transient());
        assert!(Error::Database("deadlock".into()).is_transient());
        assert!(!Error::Validation("bad input".into()).is_transient());
        assert!(!Error::Suspended.is_transient());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Error::Validation("bad input".into()).is_terminal());
        assert!(Error::NotFound("flow demo".into()).is_terminal());
        assert!(Error::Permission("namespace prod".into()).is_terminal());
        assert!(Error::Cancelled.is_terminal());
        assert!(!Error::External("timeout".into()).is_terminal());
        // Suspension is neither terminal nor transient: the scheduler
        // treats it as a successful return.
        assert!(!Error::Suspended.is_terminal());
    }
}
