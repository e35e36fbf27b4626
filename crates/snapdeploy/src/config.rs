use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::archive::DEFAULT_DEPLOYMENTS_DIR;
use crate::identity::IdentityConfig;
use crate::provision::DEFAULT_CARTRIDGE;

pub const DEFAULT_SERVER: &str = "openshift.redhat.com";

/// Top-level configuration for a deployer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub account: AccountConfig,
    pub identity: IdentityConfig,
    pub ssh: SshConfig,
    pub deploy: DeploySettings,
}

/// Credentials for the hosting account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub login: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Broker host or URL. Defaults to [`DEFAULT_SERVER`].
    pub server: Option<String>,
}

impl AccountConfig {
    /// Broker base URL, `https://` added when the server has no scheme.
    pub fn server_url(&self) -> String {
        let server = self
            .server
            .as_deref()
            .unwrap_or(DEFAULT_SERVER)
            .trim_end_matches('/');
        if server.contains("://") {
            server.to_owned()
        } else {
            format!("https://{server}")
        }
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("server", &self.server)
            .finish()
    }
}

/// How the OpenSSH client is driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// `ssh` executable.
    pub program: PathBuf,
    pub connect_timeout_secs: u64,
    /// Helper that prints the key passphrase, used as `SSH_ASKPASS`.
    pub askpass: Option<PathBuf>,
    /// Remote command that writes the deployment archive to stdout.
    pub save_command: String,
    /// Remote command that reads a deployment archive from stdin.
    pub restore_command: String,
    /// Appended to `restore_command` when a redeploy is requested.
    pub redeploy_flag: String,
    /// Extra `-o` options passed to every ssh invocation.
    pub extra_options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            connect_timeout_secs: 30,
            askpass: None,
            save_command: "gear archive-deployment".into(),
            restore_command: "oo-binary-deploy".into(),
            redeploy_flag: "--hot-deploy".into(),
            extra_options: Vec::new(),
        }
    }
}

/// Pipeline behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Directory under `/repo` that artifacts are placed in.
    pub deployments_dir: String,
    /// Cartridge used when a target has none.
    pub default_cartridge: String,
    /// Where temporary files go. System temp dir when unset.
    pub work_dir: Option<PathBuf>,
    /// Keep the saved snapshot on disk when the restore fails.
    pub retain_failed_snapshots: bool,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            deployments_dir: DEFAULT_DEPLOYMENTS_DIR.into(),
            default_cartridge: DEFAULT_CARTRIDGE.into(),
            work_dir: None,
            retain_failed_snapshots: false,
        }
    }
}

impl DeployConfig {
    /// Fill login and server from an `express.conf` file when they are unset.
    pub fn apply_express_conf(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if value.is_empty() {
                continue;
            }

            match key.trim() {
                "default_rhlogin" | "rhlogin" if self.account.login.is_none() => {
                    self.account.login = Some(value.to_owned());
                }
                "libra_server" if self.account.server.is_none() => {
                    self.account.server = Some(value.to_owned());
                }
                _ => {}
            }
        }
    }

    /// Apply `SNAPDEPLOY_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(login) = var("SNAPDEPLOY_LOGIN") {
            self.account.login = Some(login);
        }
        if let Some(password) = var("SNAPDEPLOY_PASSWORD") {
            self.account.password = Some(password);
        }
        if let Some(server) = var("SNAPDEPLOY_SERVER") {
            self.account.server = Some(server);
        }
        if let Some(passphrase) = var("SNAPDEPLOY_KEY_PASSPHRASE") {
            self.identity.passphrase = Some(passphrase);
        }
    }
}

/// Config file path: `~/.config/snapdeploy/config.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("snapdeploy").join("config.toml"))
}

/// OpenShift client settings: `~/.openshift/express.conf`
pub fn express_conf_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".openshift").join("express.conf"))
}

/// Load config from a TOML file, falling back to defaults if it is missing or
/// malformed.
pub fn load_config_file(path: &Path) -> DeployConfig {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return DeployConfig::default();
    };

    match toml::from_str::<DeployConfig>(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config, using defaults"
            );
            DeployConfig::default()
        }
    }
}

/// Load the process configuration: config file, then `express.conf` for
/// anything still unset, then environment overrides.
pub fn load_config() -> DeployConfig {
    let mut config = config_path()
        .map(|path| load_config_file(&path))
        .unwrap_or_default();

    if let Some(path) = express_conf_path()
        && let Ok(contents) = std::fs::read_to_string(&path)
    {
        config.apply_express_conf(&contents);
    }

    config.apply_env(|key| std::env::var(key).ok());
    config
}
