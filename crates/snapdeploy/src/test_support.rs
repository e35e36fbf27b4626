use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::account::{AccountError, Application, Cartridge, Domain, RemoteAccount, SshKey};
use crate::artifact::{ArtifactError, ArtifactRef, ArtifactRepository};
use crate::error::DeployError;
use crate::identity::RemoteIdentity;
use crate::session::{SessionConnector, SnapshotSession};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct AccountState {
    domain: Option<Domain>,
    applications: BTreeMap<String, (Application, String)>,
    keys: Vec<SshKey>,
    domains_created: usize,
    applications_created: usize,
    deployment_type_changes: usize,
    keys_added: usize,
    keys_removed: usize,
    fail_key_listing: bool,
    reject_key_registration: bool,
    fail_application_creation: bool,
}

/// In-memory hosting account for testing. Records every mutating call.
pub struct InMemoryAccount {
    login: String,
    cartridges: Vec<Cartridge>,
    state: Mutex<AccountState>,
}

impl InMemoryAccount {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            cartridges: ["jbossas-7", "jbossews-1.0", "jbossews-2.0", "php-5.4", "mysql-5.5"]
                .into_iter()
                .map(Cartridge::new)
                .collect(),
            state: Mutex::new(AccountState::default()),
        }
    }

    /// Start with an existing domain.
    pub fn with_domain(self, name: impl Into<String>) -> Self {
        lock(&self.state).domain = Some(Domain { name: name.into() });
        self
    }

    pub fn domain(&self) -> Option<Domain> {
        lock(&self.state).domain.clone()
    }

    pub fn application(&self, name: &str) -> Option<Application> {
        lock(&self.state)
            .applications
            .get(name)
            .map(|(app, _)| app.clone())
    }

    pub fn application_cartridge(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .applications
            .get(name)
            .map(|(_, cartridge)| cartridge.clone())
    }

    pub fn domains_created(&self) -> usize {
        lock(&self.state).domains_created
    }

    pub fn applications_created(&self) -> usize {
        lock(&self.state).applications_created
    }

    pub fn deployment_type_changes(&self) -> usize {
        lock(&self.state).deployment_type_changes
    }

    pub fn keys_added(&self) -> usize {
        lock(&self.state).keys_added
    }

    pub fn keys_removed(&self) -> usize {
        lock(&self.state).keys_removed
    }

    pub fn registered_keys(&self) -> Vec<SshKey> {
        lock(&self.state).keys.clone()
    }

    pub fn seed_key(&self, key: SshKey) {
        lock(&self.state).keys.push(key);
    }

    pub fn fail_key_listing(&self, fail: bool) {
        lock(&self.state).fail_key_listing = fail;
    }

    pub fn reject_key_registration(&self, reject: bool) {
        lock(&self.state).reject_key_registration = reject;
    }

    pub fn fail_application_creation(&self, fail: bool) {
        lock(&self.state).fail_application_creation = fail;
    }
}

#[async_trait::async_trait]
impl RemoteAccount for InMemoryAccount {
    fn login(&self) -> &str {
        &self.login
    }

    async fn default_domain(&self) -> Result<Option<Domain>, AccountError> {
        Ok(lock(&self.state).domain.clone())
    }

    async fn create_domain(&self, name: &str) -> Result<Domain, AccountError> {
        let mut state = lock(&self.state);
        if state.domain.is_some() {
            return Err(AccountError::Rejected {
                status: 409,
                message: "account already has a domain".into(),
            });
        }
        let domain = Domain { name: name.into() };
        state.domain = Some(domain.clone());
        state.domains_created += 1;
        Ok(domain)
    }

    async fn find_application(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Option<Application>, AccountError> {
        let state = lock(&self.state);
        if state.domain.as_ref() != Some(domain) {
            return Err(AccountError::NotFound(format!("domain {}", domain.name)));
        }
        Ok(state.applications.get(name).map(|(app, _)| app.clone()))
    }

    async fn standalone_cartridges(&self) -> Result<Vec<Cartridge>, AccountError> {
        Ok(self.cartridges.clone())
    }

    async fn create_application(
        &self,
        domain: &Domain,
        name: &str,
        cartridge: &Cartridge,
    ) -> Result<Application, AccountError> {
        let mut state = lock(&self.state);
        if state.fail_application_creation {
            return Err(AccountError::Rejected {
                status: 422,
                message: "gear quota exceeded".into(),
            });
        }
        if state.applications.contains_key(name) {
            return Err(AccountError::Rejected {
                status: 422,
                message: format!("application '{name}' already exists"),
            });
        }

        let host = format!("{name}-{}.rhcloud.test", domain.name);
        let application = Application {
            name: name.into(),
            domain: domain.name.clone(),
            app_url: format!("http://{host}/"),
            ssh_url: format!("ssh://5271{:04}@{host}", state.applications_created),
            deployment_type: "git".into(),
        };
        state
            .applications
            .insert(name.into(), (application.clone(), cartridge.name.clone()));
        state.applications_created += 1;
        Ok(application)
    }

    async fn enable_binary_deployment(
        &self,
        application: &Application,
    ) -> Result<Application, AccountError> {
        let mut state = lock(&self.state);
        let (stored, _) = state
            .applications
            .get_mut(&application.name)
            .ok_or_else(|| AccountError::NotFound(application.name.clone()))?;
        stored.deployment_type = "binary".into();
        let updated = stored.clone();
        state.deployment_type_changes += 1;
        Ok(updated)
    }

    async fn ssh_keys(&self) -> Result<Vec<SshKey>, AccountError> {
        let state = lock(&self.state);
        if state.fail_key_listing {
            return Err(AccountError::Network("connection reset".into()));
        }
        Ok(state.keys.clone())
    }

    async fn remove_ssh_key(&self, name: &str) -> Result<(), AccountError> {
        let mut state = lock(&self.state);
        let before = state.keys.len();
        state.keys.retain(|k| k.name != name);
        if state.keys.len() == before {
            return Err(AccountError::NotFound(format!("key {name}")));
        }
        state.keys_removed += 1;
        Ok(())
    }

    async fn add_ssh_key(&self, key: &SshKey) -> Result<(), AccountError> {
        let mut state = lock(&self.state);
        if state.reject_key_registration {
            return Err(AccountError::Rejected {
                status: 422,
                message: "key content is invalid".into(),
            });
        }
        if state.keys.iter().any(|k| k.name == key.name) {
            return Err(AccountError::Rejected {
                status: 409,
                message: format!("key name '{}' is already in use", key.name),
            });
        }
        state.keys.push(key.clone());
        state.keys_added += 1;
        Ok(())
    }
}

/// In-memory artifact repository for testing, keyed by artifact uuid.
#[derive(Default)]
pub struct InMemoryRepository {
    artifacts: HashMap<String, Vec<u8>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, uuid: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.artifacts.insert(uuid.into(), content.into());
    }
}

#[async_trait::async_trait]
impl ArtifactRepository for InMemoryRepository {
    async fn fetch_content(
        &self,
        artifact: &ArtifactRef,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ArtifactError> {
        let content = self
            .artifacts
            .get(&artifact.uuid)
            .ok_or_else(|| ArtifactError::NotFound(artifact.uuid.clone()))?;
        sink.write_all(content).await?;
        sink.flush().await?;
        Ok(content.len() as u64)
    }
}

#[derive(Default)]
struct GearState {
    snapshot: Vec<u8>,
    opens: usize,
    closes: usize,
    restores: Vec<bool>,
    fail_open: bool,
    fail_save: bool,
    fail_restore: bool,
}

/// Connector to a simulated gear that keeps its deployed state as snapshot
/// bytes. Cloning shares the gear.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    gear: Arc<Mutex<GearState>>,
}

impl ScriptedConnector {
    /// Gear whose current deployed state is `snapshot`.
    pub fn new(snapshot: Vec<u8>) -> Self {
        Self {
            gear: Arc::new(Mutex::new(GearState {
                snapshot,
                ..GearState::default()
            })),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.gear).snapshot.clone()
    }

    pub fn opens(&self) -> usize {
        lock(&self.gear).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.gear).closes
    }

    /// Redeploy flag of every restore, in order.
    pub fn restores(&self) -> Vec<bool> {
        lock(&self.gear).restores.clone()
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.gear).fail_open = fail;
    }

    pub fn fail_save(&self, fail: bool) {
        lock(&self.gear).fail_save = fail;
    }

    pub fn fail_restore(&self, fail: bool) {
        lock(&self.gear).fail_restore = fail;
    }
}

impl SessionConnector for ScriptedConnector {
    fn open(
        &self,
        application: &Application,
        _identity: &RemoteIdentity,
    ) -> Result<Box<dyn SnapshotSession>, DeployError> {
        let mut gear = lock(&self.gear);
        if gear.fail_open {
            return Err(DeployError::Transport(format!(
                "connection to {} refused",
                application.ssh_url
            )));
        }
        gear.opens += 1;
        Ok(Box::new(ScriptedSession {
            gear: Arc::clone(&self.gear),
        }))
    }
}

struct ScriptedSession {
    gear: Arc<Mutex<GearState>>,
}

impl SnapshotSession for ScriptedSession {
    fn save_snapshot(&mut self, sink: &mut dyn Write) -> Result<u64, DeployError> {
        let snapshot = {
            let gear = lock(&self.gear);
            if gear.fail_save {
                return Err(DeployError::Transport("save command exited with 1".into()));
            }
            gear.snapshot.clone()
        };
        sink.write_all(&snapshot)
            .map_err(|e| DeployError::local("failed to write snapshot", e))?;
        Ok(snapshot.len() as u64)
    }

    fn restore_snapshot(
        &mut self,
        archive: &mut (dyn Read + Send),
        trigger_redeploy: bool,
        output: &mut dyn Write,
    ) -> Result<(), DeployError> {
        let mut uploaded = Vec::new();
        archive
            .read_to_end(&mut uploaded)
            .map_err(|e| DeployError::local("failed to read patched snapshot", e))?;

        let mut gear = lock(&self.gear);
        gear.restores.push(trigger_redeploy);
        if gear.fail_restore {
            return Err(DeployError::Transport("restore command exited with 1".into()));
        }
        gear.snapshot = uploaded;
        let _ = output.write_all(b"Deployment restored\n");
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DeployError> {
        lock(&self.gear).closes += 1;
        Ok(())
    }
}

/// Build a tar+gzip snapshot holding regular files.
///
/// Paths are stored verbatim, leading `/` included, and must fit the 100 byte
/// name field.
pub fn snapshot_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        let name = &mut header.as_old_mut().name;
        assert!(path.len() <= name.len(), "test path too long: {path}");
        name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *content).expect("append test entry");
    }
    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .expect("finish test archive")
}

/// Paths and contents of every entry in a tar+gzip snapshot, in order.
pub fn snapshot_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive
        .entries()
        .expect("read test archive")
        .map(|entry| {
            let mut entry = entry.expect("read test entry");
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).expect("read test entry content");
            (path, content)
        })
        .collect()
}
