use serde::{Deserialize, Serialize};
use snapdeploy::{ArtifactError, ArtifactRef, ArtifactRepository};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Connection settings for an S-RAMP repository.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SrampConfig {
    /// Server root, e.g. `http://localhost:8080/s-ramp-server`.
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl std::fmt::Debug for SrampConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrampConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Streams artifact content out of an S-RAMP repository over its Atom API.
pub struct SrampClient {
    config: SrampConfig,
    client: reqwest::Client,
}

impl SrampClient {
    pub fn new(config: SrampConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn content_url(&self, artifact: &ArtifactRef) -> String {
        format!(
            "{}/s-ramp/{}/{}/media",
            self.config.base_url.trim_end_matches('/'),
            artifact.artifact_type.trim_matches('/'),
            artifact.uuid,
        )
    }

    fn build_request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url).header("User-Agent", "snapdeploy");

        match &self.config.username {
            Some(user) => req.basic_auth(user, self.config.password.as_deref()),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl ArtifactRepository for SrampClient {
    async fn fetch_content(
        &self,
        artifact: &ArtifactRef,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ArtifactError> {
        let url = self.content_url(artifact);
        debug!(%url, artifact = %artifact.uuid, "fetching artifact content");

        let mut response = self
            .build_request(&url)
            .send()
            .await
            .map_err(|e| ArtifactError::Transport(format!("content request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ArtifactError::NotFound(format!(
                "{} ({})",
                artifact.uuid, artifact.artifact_type
            )));
        }
        if !status.is_success() {
            return Err(ArtifactError::Transport(format!(
                "content request returned HTTP {status}"
            )));
        }

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ArtifactError::Transport(format!("failed to read content body: {e}")))?
        {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        debug!(artifact = %artifact.uuid, bytes = written, "artifact content fetched");
        Ok(written)
    }
}
