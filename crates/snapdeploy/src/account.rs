use std::sync::Arc;

/// Errors reported by a remote hosting account.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),
}

/// A namespace that owns applications. One per account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
}

/// A hosted application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub domain: String,
    /// Public URL the application is served on.
    pub app_url: String,
    /// `ssh://user@host` endpoint of the application's gear.
    pub ssh_url: String,
    /// `git` or `binary`.
    pub deployment_type: String,
}

impl Application {
    pub fn is_binary_deployment(&self) -> bool {
        self.deployment_type == "binary"
    }
}

/// A runtime an application can be created with, e.g. `jbossas-7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cartridge {
    pub name: String,
    pub display_name: Option<String>,
}

impl Cartridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
        }
    }
}

/// A public key registered with the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub name: String,
    /// Algorithm name as it appears in OpenSSH public keys, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// Base64 key blob.
    pub content: String,
}

/// The remote hosting account a deployer acts on.
///
/// Implementations talk to the platform's management API. Every method is a
/// single remote call; idempotency is layered on top by the provisioner and
/// identity manager.
#[async_trait::async_trait]
pub trait RemoteAccount: Send + Sync {
    /// Login the account is authenticated as.
    fn login(&self) -> &str;

    /// The account's domain, if it has one.
    async fn default_domain(&self) -> Result<Option<Domain>, AccountError>;

    async fn create_domain(&self, name: &str) -> Result<Domain, AccountError>;

    async fn find_application(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Option<Application>, AccountError>;

    /// Cartridges that can back a new application on their own.
    async fn standalone_cartridges(&self) -> Result<Vec<Cartridge>, AccountError>;

    async fn create_application(
        &self,
        domain: &Domain,
        name: &str,
        cartridge: &Cartridge,
    ) -> Result<Application, AccountError>;

    /// Switch the application to binary (snapshot) deployments.
    async fn enable_binary_deployment(
        &self,
        application: &Application,
    ) -> Result<Application, AccountError>;

    async fn ssh_keys(&self) -> Result<Vec<SshKey>, AccountError>;

    /// Remove the key registered under `name`. `NotFound` if there is none.
    async fn remove_ssh_key(&self, name: &str) -> Result<(), AccountError>;

    async fn add_ssh_key(&self, key: &SshKey) -> Result<(), AccountError>;
}

#[async_trait::async_trait]
impl<T: RemoteAccount + ?Sized> RemoteAccount for Arc<T> {
    fn login(&self) -> &str {
        (**self).login()
    }

    async fn default_domain(&self) -> Result<Option<Domain>, AccountError> {
        (**self).default_domain().await
    }

    async fn create_domain(&self, name: &str) -> Result<Domain, AccountError> {
        (**self).create_domain(name).await
    }

    async fn find_application(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Option<Application>, AccountError> {
        (**self).find_application(domain, name).await
    }

    async fn standalone_cartridges(&self) -> Result<Vec<Cartridge>, AccountError> {
        (**self).standalone_cartridges().await
    }

    async fn create_application(
        &self,
        domain: &Domain,
        name: &str,
        cartridge: &Cartridge,
    ) -> Result<Application, AccountError> {
        (**self).create_application(domain, name, cartridge).await
    }

    async fn enable_binary_deployment(
        &self,
        application: &Application,
    ) -> Result<Application, AccountError> {
        (**self).enable_binary_deployment(application).await
    }

    async fn ssh_keys(&self) -> Result<Vec<SshKey>, AccountError> {
        (**self).ssh_keys().await
    }

    async fn remove_ssh_key(&self, name: &str) -> Result<(), AccountError> {
        (**self).remove_ssh_key(name).await
    }

    async fn add_ssh_key(&self, key: &SshKey) -> Result<(), AccountError> {
        (**self).add_ssh_key(key).await
    }
}
