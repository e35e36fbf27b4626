use crate::archive::ArchiveError;
use crate::artifact::ArtifactError;

/// Errors that abort a deploy or undeploy call.
///
/// None of these are retried inside the pipeline. Remote side effects that
/// completed before the failure are left in place; re-running the same call
/// converges because every provisioning step is idempotent.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("artifact fetch failed: {0}")]
    ArtifactFetch(#[from] ArtifactError),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("archive format error: {0}")]
    ArchiveFormat(ArchiveError),

    #[error("local state error: {0}")]
    LocalState(String),

    #[error("invalid deployment target: {0}")]
    InvalidTarget(String),

    #[error("no deployer registered for target type '{0}'")]
    UnknownTargetType(String),
}

impl DeployError {
    /// Wrap a local I/O failure with a short description of what was attempted.
    pub fn local(context: &str, err: std::io::Error) -> Self {
        Self::LocalState(format!("{context}: {err}"))
    }

    /// Transport failures may succeed when the whole call is re-invoked.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ArchiveError> for DeployError {
    fn from(err: ArchiveError) -> Self {
        match err {
            // Failing to write the patched copy is a local disk problem, not a
            // malformed snapshot.
            ArchiveError::Write(msg) => Self::LocalState(format!("failed to write archive: {msg}")),
            ArchiveError::Content(msg) => {
                Self::LocalState(format!("failed to read artifact content: {msg}"))
            }
            other => Self::ArchiveFormat(other),
        }
    }
}
