//! Interfaces of the privileged services the install core collaborates
//! with. The core only ever holds these by handle; none of them may be
//! called while the session store lock is held.

use std::path::PathBuf;
use std::sync::{mpsc::SyncSender, Arc};

use anyhow::Error;

use airlock_api::{
    session::{SessionParams, StagedSession},
    RollbackId, SessionId,
};

#[cfg(test)]
pub(crate) mod testutil;

/// What the module daemon was asked to stage for one session.
#[derive(Clone, Debug)]
pub struct ModuleSubmission {
    pub session_id: SessionId,
    /// Ids of the module-bearing child sessions, in child order. Empty for a
    /// single-package module session.
    pub children: Vec<SessionId>,
    pub is_rollback: bool,
    pub rollback_id: Option<RollbackId>,
}

/// Descriptor of one module package accepted by the daemon for staging.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub package_name: String,
    pub version_code: i64,
    /// Path of the staged container file, for signature parsing.
    pub file_path: PathBuf,
    pub target_sdk: u32,
}

/// Activation state the daemon reports for a staged session on boot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StagedDaemonState {
    /// Verified before the reboot, but the reboot happened before the
    /// daemon could activate. The session must be re-verified.
    Verified,
    Activated,
    /// Activated and already marked successful.
    Success,
    ActivationFailed,
    Reverted,
    RevertInProgress,
    RevertFailed,
    Unknown,
}

#[derive(Clone, Debug)]
pub struct StagedDaemonInfo {
    pub state: StagedDaemonState,
    /// Token the daemon recorded if a native process crashed while the
    /// modules were being activated.
    pub crash_token: Option<String>,
}

/// The privileged daemon that activates container-format system modules
/// across a reboot. The daemon never partially activates a session.
pub trait ModuleDaemon: Send + Sync {
    fn submit(&self, submission: &ModuleSubmission) -> Result<Vec<ModuleInfo>, Error>;

    /// Returns `None` when the daemon has no record of the session.
    fn staged_info(&self, session: SessionId) -> Result<Option<StagedDaemonInfo>, Error>;

    fn mark_ready(&self, session: SessionId) -> Result<(), Error>;

    fn mark_successful(&self, session: SessionId) -> Result<(), Error>;

    fn abort_staged(&self, session: SessionId) -> Result<(), Error>;

    /// Revert all active module sessions; used when abandoning a checkpoint.
    fn revert_active(&self) -> Result<(), Error>;

    fn is_supported(&self) -> bool;

    /// Names of the archives embedded in the given active module package.
    fn list_archives_in(&self, package: &str) -> Result<Vec<String>, Error>;

    /// Whether the archives embedded in the given module package installed
    /// cleanly on this boot.
    fn is_archive_install_ok(&self, package: &str) -> Result<bool, Error>;
}

/// Filesystem checkpoint service. While a checkpoint is active, all writes
/// are provisional and a reboot reverts them wholesale.
pub trait Storage: Send + Sync {
    fn supports_checkpoint(&self) -> Result<bool, Error>;

    /// Whether the device is currently in checkpoint mode.
    fn needs_checkpoint(&self) -> Result<bool, Error>;

    fn start_checkpoint(&self, num_retries: u32) -> Result<(), Error>;

    fn abort_changes(&self, reason: &str, retry: bool) -> Result<(), Error>;
}

/// A rollback the rollback manager has committed, associating the rollback
/// id with the packages it covers.
#[derive(Clone, Debug)]
pub struct RollbackInfo {
    pub rollback_id: RollbackId,
    pub packages: Vec<String>,
}

pub trait RollbackManager: Send + Sync {
    /// Prepare a rollback for the given staged session. Failures are logged
    /// by the caller and never block the install.
    fn notify_staged(&self, session: SessionId) -> Result<RollbackId, Error>;

    /// Associate the re-materialized archive install session with the staged
    /// session it came from.
    fn notify_staged_archive(
        &self,
        staged: SessionId,
        archive_session: SessionId,
    ) -> Result<(), Error>;

    #[allow(clippy::too_many_arguments)]
    fn snapshot_and_restore_user(
        &self,
        package: &str,
        user_ids: &[u32],
        app_id: u32,
        ce_data_inode: i64,
        se_info: &str,
        token: i32,
    ) -> Result<(), Error>;

    fn recently_committed(&self) -> Result<Vec<RollbackInfo>, Error>;
}

/// Result of committing an archive install session, delivered through a
/// one-shot reply channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitStatus {
    Success,
    Failure(String),
}

/// The ordinary installer that writes application archives to disk. Staged
/// sessions re-materialize their archive portion through it.
pub trait ArchiveInstaller: Send + Sync {
    fn create_session(
        &self,
        params: &SessionParams,
        installer: &str,
        user_id: u32,
    ) -> Result<SessionId, Error>;

    fn add_child(&self, parent: SessionId, child: SessionId) -> Result<(), Error>;

    fn write(&self, session: SessionId, name: &str, source: &std::path::Path)
        -> Result<(), Error>;

    /// Commit the session. The result is delivered exactly once on `reply`.
    fn commit(&self, session: SessionId, reply: SyncSender<CommitStatus>) -> Result<(), Error>;

    /// Start verification of the archive portion of a committed staged
    /// session. Completion arrives back through the core's
    /// `notify_verification_complete`.
    fn begin_verification(&self, session: &StagedSession) -> Result<(), Error>;
}

/// Opaque signing information parsed out of a package container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningDetails {
    pub scheme_version: u32,
    pub cert_digest: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    /// The new signer may carry forward the data installed under the
    /// existing signer.
    InstalledData,
    /// The existing signer permits rolling back to packages signed by the
    /// other signer.
    Rollback,
}

/// Baseline signature scheme accepted for already-active containers.
pub const BASELINE_SIGNATURE_SCHEME: u32 = 1;

/// Minimum signature scheme a new container must use, by the SDK level it
/// targets.
pub fn min_scheme_for_sdk(target_sdk: u32) -> u32 {
    if target_sdk >= 30 {
        2
    } else {
        BASELINE_SIGNATURE_SCHEME
    }
}

pub trait SignatureVerifier: Send + Sync {
    /// Parse the signature of the container at `path`, rejecting schemes
    /// older than `min_scheme`.
    fn verify(&self, path: &std::path::Path, min_scheme: u32) -> Result<SigningDetails, Error>;

    fn has_capability(
        &self,
        details: &SigningDetails,
        other: &SigningDetails,
        capability: Capability,
    ) -> bool;
}

/// The currently-installed package the registry resolves for a package name.
#[derive(Clone, Debug)]
pub struct ActivePackage {
    pub package_name: String,
    pub version_code: i64,
    pub debuggable: bool,
    pub file_path: PathBuf,
    pub app_id: u32,
    pub ce_data_inode: i64,
    pub se_info: String,
    pub user_ids: Vec<u32>,
}

pub trait PackageRegistry: Send + Sync {
    fn active_package(&self, package: &str) -> Option<ActivePackage>;

    /// Drop cached optimized state for modules about to be updated.
    fn prune_archive_cache(&self, packages: &[String]) -> Result<(), Error>;

    /// Expand the given packages with their dependency packages.
    fn resolve_dependencies(&self, packages: &[String]) -> Vec<String>;
}

/// Device and per-app state the constraint waiter evaluates.
pub trait DeviceState: Send + Sync {
    fn is_idle(&self) -> bool;

    /// Ask to be notified once the device next becomes idle. The callback
    /// may fire from any thread.
    fn request_idle_notification(&self, notify: Box<dyn FnOnce() + Send>);

    fn is_app_foreground(&self, package: &str) -> bool;

    fn is_app_interacting(&self, package: &str) -> bool;

    fn is_app_top_visible(&self, package: &str) -> bool;

    fn is_in_call(&self) -> bool;
}

pub trait Power: Send + Sync {
    /// Fire-and-forget reboot request.
    fn reboot(&self, reason: Option<&str>);
}

/// Persistence delegate of the session store. The store never writes; it
/// hands each mutated session to the recorder.
pub trait SessionRecorder: Send + Sync {
    /// Record the current state of a session. Implementations log write
    /// failures; the store does not observe them.
    fn note_dirty(&self, session: &StagedSession);

    fn remove(&self, id: SessionId);

    fn load_all(&self) -> Result<Vec<StagedSession>, Error>;

    /// Allocate the next session id. Ids are never reused for the lifetime
    /// of the device.
    fn allocate_session_id(&self) -> Result<SessionId, Error>;
}

/// Handles to every collaborator, passed around as one bundle.
#[derive(Clone)]
pub struct Platform {
    pub daemon: Arc<dyn ModuleDaemon>,
    pub storage: Arc<dyn Storage>,
    pub rollback: Arc<dyn RollbackManager>,
    pub installer: Arc<dyn ArchiveInstaller>,
    pub signatures: Arc<dyn SignatureVerifier>,
    pub registry: Arc<dyn PackageRegistry>,
    pub device: Arc<dyn DeviceState>,
    pub power: Arc<dyn Power>,
}
