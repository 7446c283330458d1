use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::DatabaseError;

/// Problems with a pipeline definition, found by `PipelineBuilder::build`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Step {0:?} is defined twice")]
    DuplicateStep(&'static str),
    #[error("Step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency {
        step: &'static str,
        dependency: &'static str,
    },
    #[error("Dependency cycle through steps {0:?}")]
    Cycle(Vec<&'static str>),
}

/// Terminal outcome of a failed or canceled sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The run was canceled before it finished. Not a failure.
    #[error("Sync canceled")]
    Canceled,
    #[error("Remote rejected our credentials")]
    Unauthorized,
    /// The user's data on the remote was deleted from another device.
    #[error("Remote account data was deleted")]
    AccountDeleted,
    #[error("Remote error: {0}")]
    Remote(RemoteError),
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
    #[error("Invalid pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("A sync is already running")]
    AlreadyRunning,
    /// A step ran before the step producing its input stored a value.
    #[error("Step input {0:?} was never produced")]
    MissingInput(&'static str),
}

impl SyncError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, SyncError::Canceled)
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Canceled => SyncError::Canceled,
            RemoteError::Unauthorized => SyncError::Unauthorized,
            RemoteError::UserDeletedZone => SyncError::AccountDeleted,
            other => SyncError::Remote(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_mapping() {
        assert!(SyncError::from(RemoteError::Canceled).is_canceled());
        assert!(matches!(
            SyncError::from(RemoteError::UserDeletedZone),
            SyncError::AccountDeleted
        ));
        assert!(matches!(
            SyncError::from(RemoteError::Unauthorized),
            SyncError::Unauthorized
        ));
        assert!(matches!(
            SyncError::from(RemoteError::LimitExceeded),
            SyncError::Remote(RemoteError::LimitExceeded)
        ));
    }
}
