//! Gear sessions over the system OpenSSH client.
//!
//! `open` starts a control master for the gear and every snapshot command is
//! multiplexed over its socket, so authentication happens once per session.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use snapdeploy::{
    Application, DeployError, RemoteIdentity, SessionConnector, SnapshotSession, SshConfig,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Environment variable the askpass helper reads the key passphrase from.
pub const PASSPHRASE_ENV: &str = "SNAPDEPLOY_KEY_PASSPHRASE";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `user@host[:port]` parsed from an application's `ssh://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
}

impl SshEndpoint {
    pub fn parse(url: &str) -> Result<Self, DeployError> {
        let invalid = |reason: &str| DeployError::Transport(format!("invalid ssh url '{url}': {reason}"));

        let rest = url.strip_prefix("ssh://").unwrap_or(url);
        let rest = rest.trim_end_matches('/');
        let (user, authority) = rest.split_once('@').ok_or_else(|| invalid("missing user"))?;
        if user.is_empty() {
            return Err(invalid("missing user"));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| invalid("bad port"))?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() || host.contains('/') {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            user: user.to_owned(),
            host: host.to_owned(),
            port,
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn push_port(&self, args: &mut Vec<OsString>) {
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string().into());
        }
    }
}

/// Opens [`OpenSshSession`]s with the configured `ssh` program.
#[derive(Debug, Clone, Default)]
pub struct OpenSshConnector {
    config: SshConfig,
}

impl OpenSshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl SessionConnector for OpenSshConnector {
    fn open(
        &self,
        application: &Application,
        identity: &RemoteIdentity,
    ) -> Result<Box<dyn SnapshotSession>, DeployError> {
        let endpoint = SshEndpoint::parse(&application.ssh_url)?;
        let control_dir = tempfile::Builder::new()
            .prefix("snapdeploy-ssh-")
            .tempdir()
            .map_err(|e| DeployError::local("failed to create control directory", e))?;
        let socket = control_dir.path().join("control");

        let mut command = Command::new(&self.config.program);
        command
            .args(master_args(
                &self.config,
                &endpoint,
                &identity.private_key_path,
                &socket,
                identity.passphrase.is_none(),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        if let Some(passphrase) = &identity.passphrase {
            let askpass = self.config.askpass.as_ref().ok_or_else(|| {
                DeployError::Identity(
                    "private key is encrypted but no askpass helper is configured".into(),
                )
            })?;
            command
                .env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env(PASSPHRASE_ENV, passphrase);
        }

        let master = command.spawn().map_err(|e| {
            DeployError::Transport(format!(
                "failed to start {}: {e}",
                self.config.program.display()
            ))
        })?;

        let mut session = OpenSshSession {
            config: self.config.clone(),
            endpoint,
            socket,
            master: Some(master),
            _control_dir: control_dir,
        };
        session.wait_for_master()?;
        info!(
            application = %application.name,
            host = %session.endpoint.host,
            "ssh session established"
        );

        Ok(Box::new(session))
    }
}

/// A control-master connection to one gear.
pub struct OpenSshSession {
    config: SshConfig,
    endpoint: SshEndpoint,
    socket: PathBuf,
    master: Option<Child>,
    _control_dir: TempDir,
}

impl OpenSshSession {
    fn ssh(&self) -> Command {
        Command::new(&self.config.program)
    }

    fn wait_for_master(&mut self) -> Result<(), DeployError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.connect_timeout_secs + 5);

        loop {
            if let Some(master) = self.master.as_mut() {
                let exited = master
                    .try_wait()
                    .map_err(|e| DeployError::Transport(format!("failed to poll ssh: {e}")))?;
                if let Some(status) = exited {
                    let stderr = master.stderr.take().map(read_all).unwrap_or_default();
                    self.master = None;
                    return Err(DeployError::Transport(format!(
                        "ssh to {} exited with {status}: {}",
                        self.endpoint.host,
                        stderr.trim()
                    )));
                }
            }

            let ready = self
                .ssh()
                .args(control_args(&self.endpoint, &self.socket, "check"))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if ready {
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.kill_master();
                return Err(DeployError::Transport(format!(
                    "timed out connecting to {}",
                    self.endpoint.host
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Run `remote` over the master, streaming `input` to its stdin and its
    /// stdout to `output`.
    fn run(
        &self,
        remote: &str,
        input: Option<&mut (dyn Read + Send)>,
        output: &mut dyn Write,
    ) -> Result<u64, DeployError> {
        debug!(command = %remote, host = %self.endpoint.host, "running remote command");

        let mut child = self
            .ssh()
            .args(command_args(&self.config, &self.endpoint, &self.socket, remote))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DeployError::Transport(format!("failed to run '{remote}': {e}")))?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeployError::Transport("ssh stdout was not captured".into()))?;
        let stderr = child.stderr.take();

        let (uploaded, forwarded, errors) = thread::scope(|scope| {
            let uploader = scope.spawn(move || match (input, stdin) {
                (Some(input), Some(mut stdin)) => io::copy(input, &mut stdin).map(|_| ()),
                _ => Ok(()),
            });
            let collector = scope.spawn(move || stderr.map(read_all).unwrap_or_default());
            let forwarded = io::copy(&mut stdout, output);
            (
                uploader.join().unwrap_or_else(|_| {
                    Err(io::Error::other("upload thread panicked"))
                }),
                forwarded,
                collector.join().unwrap_or_default(),
            )
        });

        let status = child
            .wait()
            .map_err(|e| DeployError::Transport(format!("failed to wait for '{remote}': {e}")))?;
        check_status(remote, status, &errors)?;

        uploaded.map_err(|e| DeployError::Transport(format!("failed to upload to '{remote}': {e}")))?;
        forwarded.map_err(|e| DeployError::LocalState(format!("failed to store output of '{remote}': {e}")))
    }

    fn kill_master(&mut self) {
        if let Some(mut master) = self.master.take() {
            let _ = master.kill();
            let _ = master.wait();
        }
    }
}

impl SnapshotSession for OpenSshSession {
    fn save_snapshot(&mut self, sink: &mut dyn Write) -> Result<u64, DeployError> {
        let bytes = self.run(&self.config.save_command, None, sink)?;
        debug!(bytes, host = %self.endpoint.host, "snapshot received");
        Ok(bytes)
    }

    fn restore_snapshot(
        &mut self,
        archive: &mut (dyn Read + Send),
        trigger_redeploy: bool,
        output: &mut dyn Write,
    ) -> Result<(), DeployError> {
        let command = restore_command(&self.config, trigger_redeploy);
        self.run(&command, Some(archive), output)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), DeployError> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };

        let stopped = self
            .ssh()
            .args(control_args(&self.endpoint, &self.socket, "exit"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !stopped {
            warn!(host = %self.endpoint.host, "control master did not exit cleanly, killing it");
            let _ = master.kill();
        }

        master
            .wait()
            .map_err(|e| DeployError::Transport(format!("failed to reap ssh master: {e}")))?;
        debug!(host = %self.endpoint.host, "ssh session closed");
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        self.kill_master();
    }
}

fn read_all(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = stderr.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn check_status(remote: &str, status: ExitStatus, stderr: &str) -> Result<(), DeployError> {
    if status.success() {
        return Ok(());
    }
    Err(DeployError::Transport(format!(
        "'{remote}' exited with {status}: {}",
        stderr.trim()
    )))
}

fn restore_command(config: &SshConfig, trigger_redeploy: bool) -> String {
    if trigger_redeploy && !config.redeploy_flag.is_empty() {
        format!("{} {}", config.restore_command, config.redeploy_flag)
    } else {
        config.restore_command.clone()
    }
}

fn push_option(args: &mut Vec<OsString>, option: impl Into<OsString>) {
    args.push("-o".into());
    args.push(option.into());
}

/// Arguments that start a background control master.
fn master_args(
    config: &SshConfig,
    endpoint: &SshEndpoint,
    key: &Path,
    socket: &Path,
    batch: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-M".into(), "-S".into(), socket.into(), "-N".into()];

    // Gears are created on demand, their host keys cannot be known beforehand.
    push_option(&mut args, "StrictHostKeyChecking=no");
    push_option(&mut args, "UserKnownHostsFile=/dev/null");
    push_option(&mut args, "IdentitiesOnly=yes");
    push_option(&mut args, format!("ConnectTimeout={}", config.connect_timeout_secs));
    if batch {
        push_option(&mut args, "BatchMode=yes");
    }
    for option in &config.extra_options {
        push_option(&mut args, option.as_str());
    }

    args.push("-i".into());
    args.push(key.into());
    endpoint.push_port(&mut args);
    args.push(endpoint.destination().into());
    args
}

/// Arguments that run `remote` over an existing master.
fn command_args(
    config: &SshConfig,
    endpoint: &SshEndpoint,
    socket: &Path,
    remote: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-S".into(), socket.into()];
    push_option(&mut args, "ControlMaster=no");
    push_option(&mut args, "BatchMode=yes");
    for option in &config.extra_options {
        push_option(&mut args, option.as_str());
    }
    endpoint.push_port(&mut args);
    args.push(endpoint.destination().into());
    args.push(remote.into());
    args
}

/// Arguments for a control request (`check`, `exit`) to the master.
fn control_args(endpoint: &SshEndpoint, socket: &Path, operation: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-S".into(), socket.into(), "-O".into(), operation.into()];
    endpoint.push_port(&mut args);
    args.push(endpoint.destination().into());
    args
}
