use serde::{Deserialize, Serialize};

/// Envelope every broker response is wrapped in.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: String,
    pub severity: Option<String>,
}

/// `GET /broker/rest/domains`
#[derive(Debug, Deserialize)]
pub struct DomainResource {
    #[serde(alias = "id")]
    pub name: String,
}

/// `GET /broker/rest/domain/{domain}/application/{name}`
#[derive(Debug, Deserialize)]
pub struct ApplicationResource {
    pub name: String,
    #[serde(alias = "domain_id")]
    pub domain: Option<String>,
    pub app_url: String,
    pub ssh_url: String,
    #[serde(default = "default_deployment_type")]
    pub deployment_type: String,
}

fn default_deployment_type() -> String {
    "git".into()
}

/// `GET /broker/rest/cartridges`
#[derive(Debug, Deserialize)]
pub struct CartridgeResource {
    pub name: String,
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `GET /broker/rest/user/keys`, also the body of `POST`.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyResource {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct CreateDomain<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CreateApplication<'a> {
    pub name: &'a str,
    pub cartridges: [&'a str; 1],
}

#[derive(Debug, Serialize)]
pub struct UpdateApplication<'a> {
    pub deployment_type: &'a str,
}
