pub mod account;
pub mod archive;
pub mod artifact;
pub mod config;
pub mod error;
pub mod feedback;
pub mod identity;
pub mod orchestrator;
pub mod provision;
pub mod registry;
pub mod session;
pub mod target;

pub use account::{AccountError, Application, Cartridge, Domain, RemoteAccount, SshKey};
pub use archive::{ArchiveError, ArchivePatcher, PatchSummary};
pub use artifact::{ArtifactError, ArtifactRef, ArtifactRepository};
pub use config::{AccountConfig, DeployConfig, DeploySettings, SshConfig, load_config};
pub use error::DeployError;
pub use feedback::Feedback;
pub use identity::{IdentityConfig, IdentityManager, KeyPair, PublicKeyData, RemoteIdentity};
pub use orchestrator::{DeployOutcome, SnapshotDeployer, SnapshotMutation, UndeployOutcome};
pub use provision::ResourceProvisioner;
pub use registry::{Deployer, DeployerRegistry};
pub use session::{SessionConnector, SnapshotSession};
pub use target::{DeploymentTarget, UndeployInfo};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
