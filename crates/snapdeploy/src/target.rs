use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

pub const APPLICATION_KEY: &str = "application";
pub const DOMAIN_KEY: &str = "domain";
pub const CARTRIDGE_KEY: &str = "cartridge";

/// Named configuration identifying where an artifact is deployed.
///
/// `target_type` selects the deployer in a [`crate::DeployerRegistry`];
/// `properties` carries `application`, `domain` and optionally `cartridge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub name: String,
    pub target_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<&str, DeployError> {
        self.property(key).ok_or_else(|| {
            DeployError::InvalidTarget(format!(
                "target '{}' is missing required property '{key}'",
                self.name
            ))
        })
    }

    pub fn application(&self) -> Result<&str, DeployError> {
        self.required(APPLICATION_KEY)
    }

    pub fn domain(&self) -> Result<&str, DeployError> {
        self.required(DOMAIN_KEY)
    }

    pub fn cartridge(&self) -> Option<&str> {
        self.property(CARTRIDGE_KEY)
    }
}

/// Bookkeeping record the host passes along with an undeploy request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeployInfo {
    pub uuid: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_required_properties() {
        let target = DeploymentTarget::new("prod", "openshift")
            .with_property("application", "svc")
            .with_property("domain", "acme");

        assert_eq!(target.application().unwrap(), "svc");
        assert_eq!(target.domain().unwrap(), "acme");
        assert_eq!(target.cartridge(), None);
    }

    #[test]
    fn missing_application_is_invalid_target() {
        let target = DeploymentTarget::new("prod", "openshift").with_property("domain", "acme");
        let err = target.application().unwrap_err();
        assert!(matches!(err, DeployError::InvalidTarget(_)));
        assert!(err.to_string().contains("'application'"));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let target = DeploymentTarget::new("prod", "openshift")
            .with_property("domain", "  ")
            .with_property("cartridge", "");
        assert!(target.domain().is_err());
        assert_eq!(target.cartridge(), None);
    }

    #[test]
    fn deserializes_from_toml() {
        let target: DeploymentTarget = toml::from_str(
            r#"
name = "staging"
target_type = "openshift"

[properties]
application = "svc"
domain = "acme"
cartridge = "jbossews"
"#,
        )
        .unwrap();
        assert_eq!(target.cartridge(), Some("jbossews"));
        assert_eq!(target.target_type, "openshift");
    }
}
