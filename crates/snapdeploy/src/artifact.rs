use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

/// Reference to a build artifact held by an artifact repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Opaque repository identifier.
    pub uuid: String,
    /// File name of the artifact, e.g. `app-1.2.jar`.
    pub name: String,
    /// Repository type path, e.g. `ext/JavaArchive`.
    pub artifact_type: String,
}

impl ArtifactRef {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        artifact_type: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            artifact_type: artifact_type.into(),
        }
    }
}

/// Errors that can occur when fetching artifact content.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A repository that can stream artifact content.
#[async_trait::async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Stream the artifact's bytes into `sink`. Returns the number of bytes written.
    async fn fetch_content(
        &self,
        artifact: &ArtifactRef,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ArtifactError>;

    /// File name the artifact is deployed under.
    fn artifact_name(&self, artifact: &ArtifactRef) -> String {
        artifact.name.clone()
    }
}

#[async_trait::async_trait]
impl<T: ArtifactRepository + ?Sized> ArtifactRepository for Arc<T> {
    async fn fetch_content(
        &self,
        artifact: &ArtifactRef,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ArtifactError> {
        (**self).fetch_content(artifact, sink).await
    }

    fn artifact_name(&self, artifact: &ArtifactRef) -> String {
        (**self).artifact_name(artifact)
    }
}
