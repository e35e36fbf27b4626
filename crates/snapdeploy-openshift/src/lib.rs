pub mod broker;
mod rest;
pub mod ssh;

use std::sync::Arc;

use snapdeploy::{ArtifactRepository, DeployConfig, DeployError, DeployerRegistry, SnapshotDeployer};

pub use broker::BrokerClient;
pub use ssh::{OpenSshConnector, OpenSshSession, SshEndpoint};

/// Target type the OpenShift deployer is registered under.
pub const TARGET_TYPE: &str = "openshift";

/// Snapshot deployer for OpenShift gears, talking to the broker and the gears
/// named in `config`.
pub fn deployer(
    config: &DeployConfig,
    repository: Arc<dyn ArtifactRepository>,
) -> Result<SnapshotDeployer, DeployError> {
    let account = BrokerClient::from_config(&config.account)?;
    Ok(SnapshotDeployer::new(
        Arc::new(account),
        repository,
        Arc::new(OpenSshConnector::new(config.ssh.clone())),
        config.identity.clone(),
        config.deploy.clone(),
    ))
}

/// Registry with the OpenShift deployer under [`TARGET_TYPE`].
pub fn deployers(
    config: &DeployConfig,
    repository: Arc<dyn ArtifactRepository>,
) -> Result<DeployerRegistry, DeployError> {
    let deployer = deployer(config, repository)?;
    Ok(DeployerRegistry::new().with(TARGET_TYPE, Arc::new(deployer)))
}
