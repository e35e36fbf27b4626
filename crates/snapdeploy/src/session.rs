use std::io::{Read, Write};

use crate::account::Application;
use crate::error::DeployError;
use crate::identity::RemoteIdentity;

/// An open command channel bound to one application's gear.
///
/// Sessions move through `open → (save | restore)* → close`. `close` consumes
/// the session, so nothing can be issued on a closed channel. A session
/// serves a single deploy or undeploy call and is never shared.
///
/// The calls block; async callers run them on a blocking thread.
pub trait SnapshotSession: Send {
    /// Ask the gear to archive its deployed state and stream the tar+gzip
    /// bytes into `sink` until the remote side is done. Returns the byte count.
    fn save_snapshot(&mut self, sink: &mut dyn Write) -> Result<u64, DeployError>;

    /// Upload `archive` as the gear's new deployed state. With
    /// `trigger_redeploy` the gear redeploys from it. Remote console output
    /// is forwarded to `output` as-is.
    fn restore_snapshot(
        &mut self,
        archive: &mut (dyn Read + Send),
        trigger_redeploy: bool,
        output: &mut dyn Write,
    ) -> Result<(), DeployError>;

    /// Disconnect.
    fn close(self: Box<Self>) -> Result<(), DeployError>;
}

/// Opens snapshot sessions.
pub trait SessionConnector: Send + Sync {
    /// Connect to `application` authenticating with `identity`.
    ///
    /// The gear is provisioned on demand so its host key cannot be known in
    /// advance; implementations skip host key verification and rely on the
    /// identity having just been registered with the account.
    fn open(
        &self,
        application: &Application,
        identity: &RemoteIdentity,
    ) -> Result<Box<dyn SnapshotSession>, DeployError>;
}

impl<T: SessionConnector + ?Sized> SessionConnector for std::sync::Arc<T> {
    fn open(
        &self,
        application: &Application,
        identity: &RemoteIdentity,
    ) -> Result<Box<dyn SnapshotSession>, DeployError> {
        (**self).open(application, identity)
    }
}
