use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::ArtifactRef;
use crate::error::DeployError;
use crate::orchestrator::{DeployOutcome, SnapshotDeployer, UndeployOutcome};
use crate::target::{DeploymentTarget, UndeployInfo};

/// Deploys artifacts to one kind of target.
#[async_trait::async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        artifact: &ArtifactRef,
        target: &DeploymentTarget,
    ) -> Result<DeployOutcome, DeployError>;

    async fn undeploy(
        &self,
        previous: &ArtifactRef,
        info: &UndeployInfo,
        target: &DeploymentTarget,
    ) -> Result<UndeployOutcome, DeployError>;
}

#[async_trait::async_trait]
impl Deployer for SnapshotDeployer {
    async fn deploy(
        &self,
        artifact: &ArtifactRef,
        target: &DeploymentTarget,
    ) -> Result<DeployOutcome, DeployError> {
        SnapshotDeployer::deploy(self, artifact, target).await
    }

    async fn undeploy(
        &self,
        previous: &ArtifactRef,
        info: &UndeployInfo,
        target: &DeploymentTarget,
    ) -> Result<UndeployOutcome, DeployError> {
        SnapshotDeployer::undeploy(self, previous, info, target).await
    }
}

/// Deployers keyed by the target type they handle.
#[derive(Default, Clone)]
pub struct DeployerRegistry {
    deployers: BTreeMap<String, Arc<dyn Deployer>>,
}

impl DeployerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `deployer` for `target_type`, replacing any earlier one.
    pub fn register(&mut self, target_type: impl Into<String>, deployer: Arc<dyn Deployer>) {
        self.deployers.insert(target_type.into(), deployer);
    }

    pub fn with(mut self, target_type: impl Into<String>, deployer: Arc<dyn Deployer>) -> Self {
        self.register(target_type, deployer);
        self
    }

    pub fn get(&self, target_type: &str) -> Option<&Arc<dyn Deployer>> {
        self.deployers.get(target_type)
    }

    pub fn target_types(&self) -> impl Iterator<Item = &str> {
        self.deployers.keys().map(String::as_str)
    }

    fn resolve(&self, target: &DeploymentTarget) -> Result<&Arc<dyn Deployer>, DeployError> {
        self.get(&target.target_type)
            .ok_or_else(|| DeployError::UnknownTargetType(target.target_type.clone()))
    }

    /// Deploy with the deployer registered for `target.target_type`.
    pub async fn deploy(
        &self,
        artifact: &ArtifactRef,
        target: &DeploymentTarget,
    ) -> Result<DeployOutcome, DeployError> {
        self.resolve(target)?.deploy(artifact, target).await
    }

    pub async fn undeploy(
        &self,
        previous: &ArtifactRef,
        info: &UndeployInfo,
        target: &DeploymentTarget,
    ) -> Result<UndeployOutcome, DeployError> {
        self.resolve(target)?.undeploy(previous, info, target).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::archive::PatchSummary;

    use super::*;

    #[derive(Default)]
    struct CountingDeployer {
        deploys: AtomicUsize,
        undeploys: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Deployer for CountingDeployer {
        async fn deploy(
            &self,
            _artifact: &ArtifactRef,
            target: &DeploymentTarget,
        ) -> Result<DeployOutcome, DeployError> {
            self.deploys.fetch_add(1, Ordering::SeqCst);
            Ok(DeployOutcome {
                application_url: format!("http://{}.test/", target.name),
                summary: PatchSummary::default(),
                feedback: vec![],
            })
        }

        async fn undeploy(
            &self,
            _previous: &ArtifactRef,
            _info: &UndeployInfo,
            _target: &DeploymentTarget,
        ) -> Result<UndeployOutcome, DeployError> {
            self.undeploys.fetch_add(1, Ordering::SeqCst);
            Ok(UndeployOutcome {
                summary: None,
                feedback: vec![],
            })
        }
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef::new("u1", "app.jar", "ext/JavaArchive")
    }

    #[tokio::test]
    async fn dispatches_by_target_type() {
        let openshift = Arc::new(CountingDeployer::default());
        let other = Arc::new(CountingDeployer::default());
        let registry = DeployerRegistry::new()
            .with("openshift", openshift.clone())
            .with("rhq", other.clone());

        let target = DeploymentTarget::new("prod", "openshift");
        let outcome = registry.deploy(&artifact(), &target).await.unwrap();
        registry
            .undeploy(&artifact(), &UndeployInfo::default(), &target)
            .await
            .unwrap();

        assert_eq!(outcome.application_url, "http://prod.test/");
        assert_eq!(openshift.deploys.load(Ordering::SeqCst), 1);
        assert_eq!(openshift.undeploys.load(Ordering::SeqCst), 1);
        assert_eq!(other.deploys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_target_type_is_an_error() {
        let registry = DeployerRegistry::new();
        let target = DeploymentTarget::new("prod", "copy");

        let err = registry.deploy(&artifact(), &target).await.unwrap_err();
        assert!(matches!(err, DeployError::UnknownTargetType(ref t) if t == "copy"));
    }

    #[test]
    fn lists_registered_types() {
        let registry = DeployerRegistry::new()
            .with("rhq", Arc::new(CountingDeployer::default()))
            .with("openshift", Arc::new(CountingDeployer::default()));

        assert_eq!(registry.target_types().collect::<Vec<_>>(), ["openshift", "rhq"]);
    }
}
