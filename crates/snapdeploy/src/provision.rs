use std::cmp::Ordering;

use tracing::{info, warn};

use crate::account::{Application, Cartridge, Domain, RemoteAccount};
use crate::error::DeployError;
use crate::feedback::Feedback;

/// Java application server, used when a target names no cartridge.
pub const DEFAULT_CARTRIDGE: &str = "jbossas";

/// Idempotent creation of the domain and application a target points at.
#[derive(Debug, Clone)]
pub struct ResourceProvisioner {
    default_cartridge: String,
}

impl Default for ResourceProvisioner {
    fn default() -> Self {
        Self::new(DEFAULT_CARTRIDGE)
    }
}

impl ResourceProvisioner {
    pub fn new(default_cartridge: impl Into<String>) -> Self {
        Self {
            default_cartridge: default_cartridge.into(),
        }
    }

    /// Return the account's domain, creating `name` only if the account has
    /// none. An existing domain with another name is used as-is.
    pub async fn ensure_domain(
        &self,
        account: &dyn RemoteAccount,
        name: &str,
        feedback: &mut Vec<Feedback>,
    ) -> Result<Domain, DeployError> {
        if let Some(existing) = self.existing_domain(account, name, feedback).await? {
            return Ok(existing);
        }

        let domain = account
            .create_domain(name)
            .await
            .map_err(|e| DeployError::Provisioning(format!("failed to create domain '{name}': {e}")))?;
        info!(domain = %domain.name, "created domain");
        feedback.push(Feedback::info(format!("created domain '{}'", domain.name)));
        Ok(domain)
    }

    /// Look up the account's domain without creating one.
    ///
    /// Warns when the domain differs from `expected`.
    pub async fn existing_domain(
        &self,
        account: &dyn RemoteAccount,
        expected: &str,
        feedback: &mut Vec<Feedback>,
    ) -> Result<Option<Domain>, DeployError> {
        let domain = account
            .default_domain()
            .await
            .map_err(|e| DeployError::Provisioning(format!("failed to look up domain: {e}")))?;

        if let Some(domain) = &domain
            && domain.name != expected
        {
            warn!(
                configured = %expected,
                actual = %domain.name,
                "account domain differs from the configured domain, using the existing one"
            );
            feedback.push(Feedback::warning(format!(
                "using domain '{}' instead of configured '{expected}'",
                domain.name
            )));
        }

        Ok(domain)
    }

    /// Return the application named `name`, creating it with the latest
    /// cartridge matching `cartridge_hint` if it does not exist.
    pub async fn ensure_application(
        &self,
        account: &dyn RemoteAccount,
        domain: &Domain,
        name: &str,
        cartridge_hint: Option<&str>,
        feedback: &mut Vec<Feedback>,
    ) -> Result<Application, DeployError> {
        if let Some(existing) = self.existing_application(account, domain, name).await? {
            return Ok(existing);
        }

        let hint = cartridge_hint.unwrap_or(self.default_cartridge.as_str());
        let cartridges = account.standalone_cartridges().await.map_err(|e| {
            DeployError::Provisioning(format!("failed to list cartridges: {e}"))
        })?;
        let cartridge = latest_matching(&cartridges, hint).ok_or_else(|| {
            DeployError::Provisioning(format!("no cartridge matches '{hint}'"))
        })?;

        let application = account
            .create_application(domain, name, cartridge)
            .await
            .map_err(|e| {
                DeployError::Provisioning(format!(
                    "failed to create application '{name}' with {}: {e}",
                    cartridge.name
                ))
            })?;
        info!(
            application = %application.name,
            domain = %domain.name,
            cartridge = %cartridge.name,
            "created application"
        );
        feedback.push(Feedback::info(format!(
            "created application '{}' ({})",
            application.name, cartridge.name
        )));
        Ok(application)
    }

    pub async fn existing_application(
        &self,
        account: &dyn RemoteAccount,
        domain: &Domain,
        name: &str,
    ) -> Result<Option<Application>, DeployError> {
        account.find_application(domain, name).await.map_err(|e| {
            DeployError::Provisioning(format!("failed to look up application '{name}': {e}"))
        })
    }

    /// Switch the application to binary deployments if it is not already.
    pub async fn ensure_binary_deployment(
        &self,
        account: &dyn RemoteAccount,
        application: Application,
    ) -> Result<Application, DeployError> {
        if application.is_binary_deployment() {
            return Ok(application);
        }

        let updated = account
            .enable_binary_deployment(&application)
            .await
            .map_err(|e| {
                DeployError::Provisioning(format!(
                    "failed to enable binary deployment for '{}': {e}",
                    application.name
                ))
            })?;
        info!(application = %updated.name, "switched to binary deployment");
        Ok(updated)
    }
}

/// Latest cartridge whose name is `hint` or `hint-<version>`.
pub fn latest_matching<'a>(cartridges: &'a [Cartridge], hint: &str) -> Option<&'a Cartridge> {
    let prefix = format!("{hint}-");
    cartridges
        .iter()
        .filter(|c| c.name == hint || c.name.starts_with(&prefix))
        .max_by(|a, b| compare_versions(version_of(&a.name), version_of(&b.name)))
}

fn version_of(name: &str) -> Vec<u64> {
    name.rsplit_once('-')
        .map(|(_, version)| {
            version
                .split('.')
                .map(|part| part.parse().unwrap_or(0))
                .collect()
        })
        .unwrap_or_default()
}

fn compare_versions(a: Vec<u64>, b: Vec<u64>) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use crate::test_support::InMemoryAccount;

    use super::*;

    fn cartridges(names: &[&str]) -> Vec<Cartridge> {
        names.iter().map(|n| Cartridge::new(*n)).collect()
    }

    #[test]
    fn picks_highest_version() {
        let carts = cartridges(&["jbossas-7", "jbossews-2.0", "jbossews-1.0", "php-5.4"]);
        assert_eq!(latest_matching(&carts, "jbossews").unwrap().name, "jbossews-2.0");
        assert_eq!(latest_matching(&carts, "jbossas").unwrap().name, "jbossas-7");
    }

    #[test]
    fn compares_numerically() {
        let carts = cartridges(&["python-2.7", "python-3.10", "python-3.3"]);
        assert_eq!(latest_matching(&carts, "python").unwrap().name, "python-3.10");
    }

    #[test]
    fn exact_name_matches() {
        let carts = cartridges(&["jbossews-2.0", "jbossews-1.0"]);
        assert_eq!(
            latest_matching(&carts, "jbossews-1.0").unwrap().name,
            "jbossews-1.0"
        );
    }

    #[test]
    fn prefix_must_end_at_separator() {
        let carts = cartridges(&["jbossews-2.0"]);
        assert!(latest_matching(&carts, "jboss").is_none());
    }

    #[tokio::test]
    async fn ensure_domain_creates_once() {
        let account = InMemoryAccount::new("dev@example.com");
        let provisioner = ResourceProvisioner::default();
        let mut feedback = Vec::new();

        let first = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();
        let second = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(account.domains_created(), 1);
    }

    #[tokio::test]
    async fn ensure_domain_keeps_existing_name() {
        let account = InMemoryAccount::new("dev@example.com").with_domain("legacy");
        let provisioner = ResourceProvisioner::default();
        let mut feedback = Vec::new();

        let domain = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();

        assert_eq!(domain.name, "legacy");
        assert_eq!(account.domains_created(), 0);
        assert!(feedback.iter().any(|f| f.is_warning()));
    }

    #[tokio::test]
    async fn ensure_application_creates_once() {
        let account = InMemoryAccount::new("dev@example.com").with_domain("acme");
        let provisioner = ResourceProvisioner::default();
        let mut feedback = Vec::new();
        let domain = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();

        let first = provisioner
            .ensure_application(&account, &domain, "svc", None, &mut feedback)
            .await
            .unwrap();
        let second = provisioner
            .ensure_application(&account, &domain, "svc", None, &mut feedback)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(account.applications_created(), 1);
        assert_eq!(account.application_cartridge("svc").as_deref(), Some("jbossas-7"));
    }

    #[tokio::test]
    async fn ensure_application_uses_cartridge_hint() {
        let account = InMemoryAccount::new("dev@example.com").with_domain("acme");
        let provisioner = ResourceProvisioner::default();
        let mut feedback = Vec::new();
        let domain = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();

        provisioner
            .ensure_application(&account, &domain, "web", Some("jbossews"), &mut feedback)
            .await
            .unwrap();
        assert_eq!(account.application_cartridge("web").as_deref(), Some("jbossews-2.0"));
    }

    #[tokio::test]
    async fn unknown_cartridge_is_provisioning_error() {
        let account = InMemoryAccount::new("dev@example.com").with_domain("acme");
        let provisioner = ResourceProvisioner::default();
        let mut feedback = Vec::new();
        let domain = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();

        let err = provisioner
            .ensure_application(&account, &domain, "svc", Some("cobol"), &mut feedback)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Provisioning(_)));
        assert_eq!(account.applications_created(), 0);
    }

    #[tokio::test]
    async fn binary_deployment_is_enabled_once() {
        let account = InMemoryAccount::new("dev@example.com").with_domain("acme");
        let provisioner = ResourceProvisioner::default();
        let mut feedback = Vec::new();
        let domain = provisioner.ensure_domain(&account, "acme", &mut feedback).await.unwrap();
        let app = provisioner
            .ensure_application(&account, &domain, "svc", None, &mut feedback)
            .await
            .unwrap();

        let app = provisioner.ensure_binary_deployment(&account, app).await.unwrap();
        assert!(app.is_binary_deployment());
        provisioner.ensure_binary_deployment(&account, app).await.unwrap();
        assert_eq!(account.deployment_type_changes(), 1);
    }
}
