use std::io::{self, BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::account::{Application, RemoteAccount};
use crate::archive::{ArchivePatcher, PatchSummary, validate_entry_name};
use crate::artifact::{ArtifactRef, ArtifactRepository};
use crate::config::DeploySettings;
use crate::error::DeployError;
use crate::feedback::Feedback;
use crate::identity::{IdentityConfig, IdentityManager, RemoteIdentity};
use crate::provision::ResourceProvisioner;
use crate::session::{SessionConnector, SnapshotSession};
use crate::target::{DeploymentTarget, UndeployInfo};

const SNAPSHOT_PREFIX: &str = "openshift-snapshot";
const PATCHED_PREFIX: &str = "new-openshift-snapshot";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Change applied to the saved snapshot before it is restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotMutation {
    /// Add the local file at `path` as `/repo/<deployments>/<name>`.
    Append {
        name: String,
        path: PathBuf,
        size: u64,
    },
    /// Drop every entry whose path contains `fragment`.
    Remove { fragment: String },
}

/// Result of a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Public URL of the application the artifact was deployed to.
    pub application_url: String,
    pub summary: PatchSummary,
    pub feedback: Vec<Feedback>,
}

/// Result of a successful undeploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndeployOutcome {
    /// `None` when there was no application to undeploy from.
    pub summary: Option<PatchSummary>,
    pub feedback: Vec<Feedback>,
}

impl UndeployOutcome {
    /// Archive paths that were removed.
    pub fn removed(&self) -> &[String] {
        self.summary
            .as_ref()
            .map(|s| s.removed.as_slice())
            .unwrap_or_default()
    }
}

/// Deploys artifacts by rewriting an application's deployment snapshot.
///
/// Each call runs `download → provision → register key → save → patch →
/// restore` and stops at the first failing step. Remote changes made before
/// the failure stay in place; repeating the call converges.
pub struct SnapshotDeployer {
    account: Arc<dyn RemoteAccount>,
    repository: Arc<dyn ArtifactRepository>,
    connector: Arc<dyn SessionConnector>,
    identity: IdentityManager,
    provisioner: ResourceProvisioner,
    patcher: ArchivePatcher,
    settings: DeploySettings,
}

impl SnapshotDeployer {
    pub fn new(
        account: Arc<dyn RemoteAccount>,
        repository: Arc<dyn ArtifactRepository>,
        connector: Arc<dyn SessionConnector>,
        identity: IdentityConfig,
        settings: DeploySettings,
    ) -> Self {
        Self {
            account,
            repository,
            connector,
            identity: IdentityManager::new(identity),
            provisioner: ResourceProvisioner::new(settings.default_cartridge.clone()),
            patcher: ArchivePatcher::new(settings.deployments_dir.clone()),
            settings,
        }
    }

    pub async fn deploy(
        &self,
        artifact: &ArtifactRef,
        target: &DeploymentTarget,
    ) -> Result<DeployOutcome, DeployError> {
        let application_name = target.application()?;
        let domain_name = target.domain()?;
        let entry_name = self.repository.artifact_name(artifact);
        validate_entry_name(&entry_name)?;
        let mut feedback = Vec::new();

        info!(
            artifact = %artifact.uuid,
            name = %entry_name,
            target = %target.name,
            application = %application_name,
            "deploying artifact"
        );

        let (download, size) = self.download(artifact).await?;

        let account = self.account.as_ref();
        let domain = self
            .provisioner
            .ensure_domain(account, domain_name, &mut feedback)
            .await?;
        let application = self
            .provisioner
            .ensure_application(
                account,
                &domain,
                application_name,
                target.cartridge(),
                &mut feedback,
            )
            .await?;
        let application = self
            .provisioner
            .ensure_binary_deployment(account, application)
            .await?;
        let identity = self.identity.ensure_registered(account).await?;

        let mutation = SnapshotMutation::Append {
            name: entry_name,
            path: download.path().to_path_buf(),
            size,
        };
        let summary = self
            .rewrite_snapshot(application.clone(), identity, mutation)
            .await?;

        info!(
            application = %application.name,
            url = %application.app_url,
            "artifact deployed"
        );
        feedback.push(Feedback::info(format!(
            "deployed to {}",
            application.app_url
        )));

        Ok(DeployOutcome {
            application_url: application.app_url,
            summary,
            feedback,
        })
    }

    /// Remove a previously deployed artifact from the target application.
    ///
    /// Nothing is created: a missing domain or application means there is
    /// nothing to remove, and the call succeeds with a warning.
    pub async fn undeploy(
        &self,
        previous: &ArtifactRef,
        info: &UndeployInfo,
        target: &DeploymentTarget,
    ) -> Result<UndeployOutcome, DeployError> {
        let application_name = target.application()?;
        let domain_name = target.domain()?;
        let entry_name = self.repository.artifact_name(previous);
        let mut feedback = Vec::new();

        info!(
            artifact = %previous.uuid,
            name = %entry_name,
            record = ?info.uuid,
            target = %target.name,
            application = %application_name,
            "undeploying artifact"
        );

        let account = self.account.as_ref();
        let Some(domain) = self
            .provisioner
            .existing_domain(account, domain_name, &mut feedback)
            .await?
        else {
            warn!(domain = %domain_name, "account has no domain, nothing to undeploy");
            feedback.push(Feedback::warning(format!(
                "account has no domain, '{entry_name}' is not deployed"
            )));
            return Ok(UndeployOutcome {
                summary: None,
                feedback,
            });
        };

        let Some(application) = self
            .provisioner
            .existing_application(account, &domain, application_name)
            .await?
        else {
            warn!(
                domain = %domain.name,
                application = %application_name,
                "application does not exist, nothing to undeploy"
            );
            feedback.push(Feedback::warning(format!(
                "application '{application_name}' does not exist, '{entry_name}' is not deployed"
            )));
            return Ok(UndeployOutcome {
                summary: None,
                feedback,
            });
        };

        let application = self
            .provisioner
            .ensure_binary_deployment(account, application)
            .await?;
        let identity = self.identity.ensure_registered(account).await?;

        let mutation = SnapshotMutation::Remove {
            fragment: entry_name.clone(),
        };
        let summary = self
            .rewrite_snapshot(application.clone(), identity, mutation)
            .await?;

        if summary.removed.is_empty() {
            warn!(
                application = %application.name,
                name = %entry_name,
                "artifact was not present in the snapshot"
            );
            feedback.push(Feedback::warning(format!(
                "'{entry_name}' was not deployed to '{}'",
                application.name
            )));
        } else {
            info!(
                application = %application.name,
                removed = summary.removed.len(),
                "artifact undeployed"
            );
        }

        Ok(UndeployOutcome {
            summary: Some(summary),
            feedback,
        })
    }

    /// Stream the artifact into a scratch file and return it with its size.
    async fn download(&self, artifact: &ArtifactRef) -> Result<(NamedTempFile, u64), DeployError> {
        let scratch = scratch_file(self.settings.work_dir.as_deref(), "artifact-", "")?;
        let handle = scratch
            .reopen()
            .map_err(|e| DeployError::local("failed to open artifact file", e))?;

        let mut file = tokio::fs::File::from_std(handle);
        let written = self.repository.fetch_content(artifact, &mut file).await?;
        file.flush()
            .await
            .map_err(|e| DeployError::local("failed to write artifact file", e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| DeployError::local("failed to stat artifact file", e))?
            .len();

        if written != size {
            warn!(reported = written, on_disk = size, "artifact size mismatch, using file size");
        }
        debug!(artifact = %artifact.uuid, size, path = %scratch.path().display(), "downloaded artifact");
        Ok((scratch, size))
    }

    async fn rewrite_snapshot(
        &self,
        application: Application,
        identity: RemoteIdentity,
        mutation: SnapshotMutation,
    ) -> Result<PatchSummary, DeployError> {
        let connector = Arc::clone(&self.connector);
        let patcher = self.patcher.clone();
        let settings = self.settings.clone();

        tokio::task::spawn_blocking(move || {
            rewrite_snapshot(
                connector.as_ref(),
                &application,
                &identity,
                &patcher,
                &mutation,
                &settings,
            )
        })
        .await
        .map_err(|e| DeployError::LocalState(format!("snapshot task failed: {e}")))?
    }
}

/// Open a session, run the exchange, and close the session exactly once.
fn rewrite_snapshot(
    connector: &dyn SessionConnector,
    application: &Application,
    identity: &RemoteIdentity,
    patcher: &ArchivePatcher,
    mutation: &SnapshotMutation,
    settings: &DeploySettings,
) -> Result<PatchSummary, DeployError> {
    let mut session = connector.open(application, identity)?;
    debug!(application = %application.name, endpoint = %application.ssh_url, "session opened");

    let result = exchange(session.as_mut(), patcher, mutation, settings);

    match (result, session.close()) {
        (result, Ok(())) => {
            debug!(application = %application.name, "session closed");
            result
        }
        (Ok(summary), Err(e)) => {
            warn!(application = %application.name, error = %e, "failed to close session after restore");
            Ok(summary)
        }
        (Err(e), Err(close)) => {
            warn!(application = %application.name, error = %close, "failed to close session");
            Err(e)
        }
    }
}

fn exchange(
    session: &mut dyn SnapshotSession,
    patcher: &ArchivePatcher,
    mutation: &SnapshotMutation,
    settings: &DeploySettings,
) -> Result<PatchSummary, DeployError> {
    let work_dir = settings.work_dir.as_deref();

    let mut saved = scratch_file(work_dir, SNAPSHOT_PREFIX, ARCHIVE_SUFFIX)?;
    let bytes = {
        let mut sink = BufWriter::new(saved.as_file_mut());
        let bytes = session.save_snapshot(&mut sink)?;
        sink.flush()
            .map_err(|e| DeployError::local("failed to write snapshot", e))?;
        bytes
    };
    debug!(bytes, path = %saved.path().display(), "snapshot saved");

    let source = BufReader::new(
        saved
            .reopen()
            .map_err(|e| DeployError::local("failed to reopen snapshot", e))?,
    );
    let mut patched = scratch_file(work_dir, PATCHED_PREFIX, ARCHIVE_SUFFIX)?;
    let out = BufWriter::new(patched.as_file_mut());

    let summary = match mutation {
        SnapshotMutation::Append { name, path, size } => {
            let content = std::fs::File::open(path)
                .map_err(|e| DeployError::local("failed to open artifact file", e))?;
            patcher.append(source, BufReader::new(content), name, *size, out)?
        }
        SnapshotMutation::Remove { fragment } => patcher.remove(source, fragment, out)?,
    };
    debug!(
        copied = summary.copied,
        removed = summary.removed.len(),
        added = ?summary.added,
        "snapshot patched"
    );

    patched
        .as_file_mut()
        .rewind()
        .map_err(|e| DeployError::local("failed to rewind patched snapshot", e))?;
    let mut upload = BufReader::new(patched.as_file_mut());
    let mut console = ConsoleLog::default();

    if let Err(e) = session.restore_snapshot(&mut upload, true, &mut console) {
        if settings.retain_failed_snapshots {
            retain(saved);
        }
        return Err(e);
    }

    Ok(summary)
}

/// Persist the pre-patch snapshot so the deployed state can be recovered by
/// hand.
fn retain(saved: NamedTempFile) {
    match saved.keep() {
        Ok((_, path)) => {
            warn!(path = %path.display(), "restore failed, kept the saved snapshot");
        }
        Err(e) => {
            warn!(error = %e.error, "restore failed and the saved snapshot could not be kept");
        }
    }
}

fn scratch_file(
    work_dir: Option<&Path>,
    prefix: &str,
    suffix: &str,
) -> Result<NamedTempFile, DeployError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(suffix);
    match work_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| DeployError::local("failed to create temporary file", e))
}

/// Forwards remote console output to the log line by line.
#[derive(Default)]
struct ConsoleLog {
    pending: Vec<u8>,
}

impl ConsoleLog {
    fn emit(line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        if !text.is_empty() {
            info!(target: "snapdeploy::remote", "{text}");
        }
    }
}

impl Write for ConsoleLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            Self::emit(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ConsoleLog {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            Self::emit(&self.pending);
        }
    }
}
