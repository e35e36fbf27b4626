use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tracing::{debug, info, warn};

use crate::account::{AccountError, RemoteAccount, SshKey};
use crate::error::DeployError;

pub const DEFAULT_KEY_NAME: &str = "dtgov-key";
const DEFAULT_KEY_FILE: &str = "dtgov_ed25519";

/// Where the deployer's key pair lives and how it is registered remotely.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// Passphrase protecting the private key. `None` stores it unencrypted.
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    /// Name the public key is registered under on the account.
    pub key_name: String,
}

impl IdentityConfig {
    /// Key pair at `<dir>/<file_name>` and `<dir>/<file_name>.pub`.
    pub fn in_dir(dir: &Path, file_name: &str) -> Self {
        Self {
            private_key_path: dir.join(file_name),
            public_key_path: dir.join(format!("{file_name}.pub")),
            passphrase: None,
            key_name: DEFAULT_KEY_NAME.into(),
        }
    }

    fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().filter(|p| !p.is_empty())
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh");
        Self::in_dir(&ssh_dir, DEFAULT_KEY_FILE)
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("private_key_path", &self.private_key_path)
            .field("public_key_path", &self.public_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("key_name", &self.key_name)
            .finish()
    }
}

/// Public half of a key pair in the form the account API uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyData {
    /// e.g. `ssh-ed25519`
    pub key_type: String,
    /// Base64 key blob.
    pub content: String,
}

impl PublicKeyData {
    fn from_public_key(key: &PublicKey) -> Result<Self, String> {
        let encoded = key.to_openssh().map_err(|e| e.to_string())?;
        let mut parts = encoded.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(key_type), Some(content)) => Ok(Self {
                key_type: key_type.to_owned(),
                content: content.to_owned(),
            }),
            _ => Err(format!("unexpected public key encoding: {encoded}")),
        }
    }

    pub fn matches(&self, key: &SshKey) -> bool {
        self.key_type == key.key_type && self.content == key.content.trim()
    }

    pub fn to_ssh_key(&self, name: &str) -> SshKey {
        SshKey {
            name: name.to_owned(),
            key_type: self.key_type.clone(),
            content: self.content.clone(),
        }
    }
}

/// A key pair available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public: PublicKeyData,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// True when the pair was created by this call.
    pub generated: bool,
}

/// Key material the session layer authenticates with.
#[derive(Clone)]
pub struct RemoteIdentity {
    pub key_name: String,
    pub public: PublicKeyData,
    pub private_key_path: PathBuf,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdentity")
            .field("key_name", &self.key_name)
            .field("public", &self.public)
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Makes sure the local key pair exists and is registered with the account.
#[derive(Debug, Clone)]
pub struct IdentityManager {
    config: IdentityConfig,
}

impl IdentityManager {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Load the configured key pair, generating a new one if it is missing or
    /// unreadable.
    pub fn load_or_generate(&self) -> Result<KeyPair, DeployError> {
        load_or_generate(&self.config)
    }

    /// Ensure the account knows the local public key.
    ///
    /// Fast path: the key is already registered, nothing is changed. Otherwise
    /// any registration under the configured name is destroyed and the key is
    /// registered under that name.
    pub async fn ensure_registered(
        &self,
        account: &dyn RemoteAccount,
    ) -> Result<RemoteIdentity, DeployError> {
        let config = self.config.clone();
        let pair = tokio::task::spawn_blocking(move || load_or_generate(&config))
            .await
            .map_err(|e| DeployError::LocalState(format!("key loading task failed: {e}")))??;

        let identity = RemoteIdentity {
            key_name: self.config.key_name.clone(),
            public: pair.public.clone(),
            private_key_path: pair.private_key_path.clone(),
            passphrase: self.config.passphrase().map(str::to_owned),
        };

        let registered = if pair.generated {
            None
        } else {
            match account.ssh_keys().await {
                Ok(keys) => keys.into_iter().find(|k| pair.public.matches(k)),
                Err(e) => {
                    warn!(error = %e, "could not list registered keys, registering again");
                    None
                }
            }
        };

        if let Some(existing) = registered {
            debug!(key = %existing.name, "public key already registered");
            return Ok(identity);
        }

        let name = &self.config.key_name;
        match account.remove_ssh_key(name).await {
            Ok(()) => info!(key = %name, "removed stale key registration"),
            Err(AccountError::NotFound(_)) => {}
            Err(e) => {
                return Err(DeployError::Identity(format!(
                    "failed to remove key '{name}': {e}"
                )));
            }
        }

        account
            .add_ssh_key(&pair.public.to_ssh_key(name))
            .await
            .map_err(|e| DeployError::Identity(format!("failed to register key '{name}': {e}")))?;
        info!(key = %name, login = %account.login(), "registered public key");

        Ok(identity)
    }
}

fn load_or_generate(config: &IdentityConfig) -> Result<KeyPair, DeployError> {
    match load(config) {
        Ok(pair) => Ok(pair),
        Err(reason) => {
            info!(
                path = %config.private_key_path.display(),
                %reason,
                "generating a new key pair"
            );
            generate(config)
        }
    }
}

fn load(config: &IdentityConfig) -> Result<KeyPair, String> {
    let mut private =
        PrivateKey::read_openssh_file(&config.private_key_path).map_err(|e| e.to_string())?;
    if private.is_encrypted() {
        let passphrase = config
            .passphrase()
            .ok_or_else(|| "private key is encrypted but no passphrase is configured".to_owned())?;
        private = private.decrypt(passphrase).map_err(|e| e.to_string())?;
    }

    let public =
        PublicKey::read_openssh_file(&config.public_key_path).map_err(|e| e.to_string())?;
    if public.key_data() != private.public_key().key_data() {
        return Err("public key does not belong to the private key".into());
    }

    Ok(KeyPair {
        public: PublicKeyData::from_public_key(&public)?,
        private_key_path: config.private_key_path.clone(),
        public_key_path: config.public_key_path.clone(),
        generated: false,
    })
}

fn generate(config: &IdentityConfig) -> Result<KeyPair, DeployError> {
    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| DeployError::Identity(format!("key generation failed: {e}")))?;
    let public = PublicKeyData::from_public_key(private.public_key())
        .map_err(DeployError::Identity)?;
    let public_line = private
        .public_key()
        .to_openssh()
        .map_err(|e| DeployError::Identity(format!("failed to encode public key: {e}")))?;

    let stored = match config.passphrase() {
        Some(passphrase) => private
            .encrypt(&mut OsRng, passphrase)
            .map_err(|e| DeployError::Identity(format!("failed to encrypt private key: {e}")))?,
        None => private,
    };
    let private_pem = stored
        .to_openssh(LineEnding::LF)
        .map_err(|e| DeployError::Identity(format!("failed to encode private key: {e}")))?;

    if let Some(parent) = config.private_key_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            DeployError::local(&format!("failed to create {}", parent.display()), e)
        })?;
    }
    write_key_file(&config.private_key_path, private_pem.as_bytes(), 0o600)?;
    write_key_file(
        &config.public_key_path,
        format!("{public_line}\n").as_bytes(),
        0o644,
    )?;

    Ok(KeyPair {
        public,
        private_key_path: config.private_key_path.clone(),
        public_key_path: config.public_key_path.clone(),
        generated: true,
    })
}

/// Replace `path` with `contents`, created with `mode` on unix.
fn write_key_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), DeployError> {
    let context = format!("failed to write {}", path.display());

    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(DeployError::local(&context, e)),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .map_err(|e| DeployError::local(&context, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| DeployError::local(&context, e))
}
