use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snapdeploy::{
    AccountConfig, AccountError, Application, Cartridge, DeployError, Domain, RemoteAccount,
    SshKey,
};
use tracing::debug;

use crate::rest::{
    ApplicationResource, CartridgeResource, CreateApplication, CreateDomain, DomainResource,
    Envelope, KeyResource, UpdateApplication,
};

const API_VERSION: &str = "1.6";

/// OpenShift broker REST client for one account.
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: String,
    login: String,
    password: Option<String>,
}

impl BrokerClient {
    /// `base_url` is the broker root, e.g. `https://openshift.redhat.com`.
    pub fn new(base_url: impl Into<String>, login: impl Into<String>, password: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            login: login.into(),
            password,
        }
    }

    pub fn from_config(config: &AccountConfig) -> Result<Self, DeployError> {
        let login = config.login.clone().ok_or_else(|| {
            DeployError::Provisioning("no account login configured".into())
        })?;
        Ok(Self::new(config.server_url(), login, config.password.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/broker/rest/{}", self.base_url, path)
    }

    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Accept", format!("application/json; version={API_VERSION}"))
            .header("User-Agent", "snapdeploy")
            .basic_auth(&self.login, self.password.as_deref())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Option<T>, AccountError> {
        let response = request
            .send()
            .await
            .map_err(|e| AccountError::Network(format!("{what} failed: {e}")))?;
        let status = response.status();
        debug!(%status, request = %what, "broker response");

        if status == StatusCode::NOT_FOUND {
            return Err(AccountError::NotFound(what.to_owned()));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AccountError::Network(format!("failed to read {what} response: {e}")))?;

        if !status.is_success() {
            return Err(AccountError::Rejected {
                status: status.as_u16(),
                message: rejection_message(&body, status),
            });
        }
        if body.is_empty() {
            return Ok(None);
        }

        let envelope: Envelope<T> = serde_json::from_slice(&body)
            .map_err(|e| AccountError::Parse(format!("failed to parse {what} response: {e}")))?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, AccountError> {
        self.send(self.build_request(Method::GET, path), what)
            .await?
            .ok_or_else(|| AccountError::Parse(format!("{what} response has no data")))
    }

    async fn submit<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T, AccountError> {
        self.send(self.build_request(method, path).json(body), what)
            .await?
            .ok_or_else(|| AccountError::Parse(format!("{what} response has no data")))
    }
}

fn rejection_message(body: &[u8], status: StatusCode) -> String {
    let texts: Vec<String> = serde_json::from_slice::<Envelope<serde_json::Value>>(body)
        .map(|envelope| {
            envelope
                .messages
                .into_iter()
                .filter(|m| m.severity.as_deref() != Some("info"))
                .map(|m| m.text)
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if texts.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_owned()
    } else {
        texts.join("; ")
    }
}

fn application_from(resource: ApplicationResource, domain: &str) -> Application {
    Application {
        name: resource.name,
        domain: resource.domain.unwrap_or_else(|| domain.to_owned()),
        app_url: resource.app_url,
        ssh_url: resource.ssh_url,
        deployment_type: resource.deployment_type,
    }
}

#[async_trait::async_trait]
impl RemoteAccount for BrokerClient {
    fn login(&self) -> &str {
        &self.login
    }

    async fn default_domain(&self) -> Result<Option<Domain>, AccountError> {
        let domains: Vec<DomainResource> = self.get("domains", "domain listing").await?;
        Ok(domains.into_iter().next().map(|d| Domain { name: d.name }))
    }

    async fn create_domain(&self, name: &str) -> Result<Domain, AccountError> {
        let created: DomainResource = self
            .submit(Method::POST, "domains", &CreateDomain { name }, "domain creation")
            .await?;
        Ok(Domain { name: created.name })
    }

    async fn find_application(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Option<Application>, AccountError> {
        let path = format!("domain/{}/application/{}", domain.name, name);
        match self.get::<ApplicationResource>(&path, "application lookup").await {
            Ok(resource) => Ok(Some(application_from(resource, &domain.name))),
            Err(AccountError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn standalone_cartridges(&self) -> Result<Vec<Cartridge>, AccountError> {
        let cartridges: Vec<CartridgeResource> =
            self.get("cartridges", "cartridge listing").await?;
        Ok(cartridges
            .into_iter()
            .filter(|c| c.kind.as_deref() == Some("standalone"))
            .map(|c| Cartridge {
                name: c.name,
                display_name: c.display_name,
            })
            .collect())
    }

    async fn create_application(
        &self,
        domain: &Domain,
        name: &str,
        cartridge: &Cartridge,
    ) -> Result<Application, AccountError> {
        let path = format!("domain/{}/applications", domain.name);
        let body = CreateApplication {
            name,
            cartridges: [cartridge.name.as_str()],
        };
        let created: ApplicationResource = self
            .submit(Method::POST, &path, &body, "application creation")
            .await?;
        Ok(application_from(created, &domain.name))
    }

    async fn enable_binary_deployment(
        &self,
        application: &Application,
    ) -> Result<Application, AccountError> {
        let path = format!(
            "domain/{}/application/{}",
            application.domain, application.name
        );
        let body = UpdateApplication {
            deployment_type: "binary",
        };
        let updated: ApplicationResource = self
            .submit(Method::PUT, &path, &body, "application update")
            .await?;
        Ok(application_from(updated, &application.domain))
    }

    async fn ssh_keys(&self) -> Result<Vec<SshKey>, AccountError> {
        let keys: Vec<KeyResource> = self.get("user/keys", "key listing").await?;
        Ok(keys
            .into_iter()
            .map(|k| SshKey {
                name: k.name,
                key_type: k.key_type,
                content: k.content,
            })
            .collect())
    }

    async fn remove_ssh_key(&self, name: &str) -> Result<(), AccountError> {
        let path = format!("user/keys/{name}");
        self.send::<serde_json::Value>(self.build_request(Method::DELETE, &path), "key removal")
            .await
            .map(|_| ())
            .map_err(|e| match e {
                AccountError::NotFound(_) => AccountError::NotFound(format!("key {name}")),
                other => other,
            })
    }

    async fn add_ssh_key(&self, key: &SshKey) -> Result<(), AccountError> {
        let body = KeyResource {
            name: key.name.clone(),
            key_type: key.key_type.clone(),
            content: key.content.clone(),
        };
        self.send::<serde_json::Value>(
            self.build_request(Method::POST, "user/keys").json(&body),
            "key registration",
        )
        .await
        .map(|_| ())
    }
}
