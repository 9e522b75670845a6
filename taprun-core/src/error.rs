// Context Errors
// Error taxonomy shared by the execution context, job results, fixtures and caches

use crate::job::JobState;

use std::io;
use thiserror::Error;

pub type ContextResult<T> = Result<T, ContextError>;

/// Errors raised by the execution-context control layer
///
/// One job failure settles every pending deferred result, and a failed cache
/// initialisation is returned to every caller, so errors are cloned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    #[error("execution context is already closed")]
    AlreadyClosed,

    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("job finished in state {state}")]
    JobFailed { state: JobState },

    #[error("no fixture registered for {what} in test run '{run_id}'")]
    MissingFixture { run_id: String, what: String },

    #[error("test run '{0}' is already registered")]
    DuplicateRunId(String),

    #[error("distributed cache initialisation failed: {0}")]
    CacheInit(String),

    #[error("connector error: {0}")]
    Connector(String),

    #[error("assertion failed for {descriptor}: {message}")]
    AssertionFailed { descriptor: String, message: String },

    #[error("blocking wait called from inside an async runtime")]
    BlockingInRuntime,

    #[error("blocking wait needs a multi-threaded runtime to drive the job")]
    BlockingOnCurrentThread,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ContextError {
    pub fn missing_fixture(run_id: impl Into<String>, what: impl Into<String>) -> Self {
        Self::MissingFixture {
            run_id: run_id.into(),
            what: what.into(),
        }
    }

    pub fn assertion(descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AssertionFailed {
            descriptor: descriptor.into(),
            message: message.into(),
        }
    }

    /// Whether this error reports a job that ran but did not succeed
    pub fn is_job_failure(&self) -> bool {
        matches!(self, Self::JobFailed { .. })
    }
}

impl From<io::Error> for ContextError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ContextError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_failure_carries_state() {
        let err = ContextError::JobFailed {
            state: JobState::Failed,
        };
        assert!(err.is_job_failure());
        assert_eq!(err.to_string(), "job finished in state FAILED");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ContextError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, ContextError::Io(msg) if msg.contains("gone")));
    }

    #[test]
    fn test_missing_fixture_message() {
        let err = ContextError::missing_fixture("t1", "input local_file:in.json");
        assert_eq!(
            err.to_string(),
            "no fixture registered for input local_file:in.json in test run 't1'"
        );
    }
}
