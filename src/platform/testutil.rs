//! Scripted collaborator implementations for unit tests. Each mock records
//! the calls it receives and lets tests steer the next response.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    mpsc::SyncSender,
    Arc, Mutex,
};

use anyhow::{anyhow, Error};

use airlock_api::{
    session::{SessionParams, StagedSession},
    RollbackId, SessionId,
};

use super::{
    ActivePackage, ArchiveInstaller, Capability, CommitStatus, DeviceState, ModuleDaemon,
    ModuleInfo, ModuleSubmission, PackageRegistry, Platform, Power, RollbackInfo,
    RollbackManager, SessionRecorder, SigningDetails, SignatureVerifier, StagedDaemonInfo,
    Storage,
};

#[derive(Default)]
pub struct MockDaemon {
    pub supported: AtomicBool,
    pub submissions: Mutex<Vec<ModuleSubmission>>,
    /// Descriptors returned from `submit`, keyed by session id.
    pub submit_results: Mutex<HashMap<SessionId, Vec<ModuleInfo>>>,
    pub submit_errors: Mutex<HashSet<SessionId>>,
    /// `staged_info` responses; a missing entry means the daemon has no
    /// record of the session.
    pub infos: Mutex<HashMap<SessionId, StagedDaemonInfo>>,
    pub archives_in: Mutex<HashMap<String, Vec<String>>>,
    pub archive_ok: Mutex<HashMap<String, bool>>,
    pub aborted: Mutex<Vec<SessionId>>,
    pub ready: Mutex<Vec<SessionId>>,
    pub successful: Mutex<Vec<SessionId>>,
    pub reverts: AtomicU32,
    pub fail_mark_ready: AtomicBool,
}

impl ModuleDaemon for MockDaemon {
    fn submit(&self, submission: &ModuleSubmission) -> Result<Vec<ModuleInfo>, Error> {
        self.submissions.lock().unwrap().push(submission.clone());
        if self
            .submit_errors
            .lock()
            .unwrap()
            .contains(&submission.session_id)
        {
            return Err(anyhow!("daemon rejected submission"));
        }
        Ok(self
            .submit_results
            .lock()
            .unwrap()
            .get(&submission.session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn staged_info(&self, session: SessionId) -> Result<Option<StagedDaemonInfo>, Error> {
        Ok(self.infos.lock().unwrap().get(&session).cloned())
    }

    fn mark_ready(&self, session: SessionId) -> Result<(), Error> {
        if self.fail_mark_ready.load(Ordering::SeqCst) {
            return Err(anyhow!("daemon unreachable"));
        }
        self.ready.lock().unwrap().push(session);
        Ok(())
    }

    fn mark_successful(&self, session: SessionId) -> Result<(), Error> {
        self.successful.lock().unwrap().push(session);
        Ok(())
    }

    fn abort_staged(&self, session: SessionId) -> Result<(), Error> {
        self.aborted.lock().unwrap().push(session);
        Ok(())
    }

    fn revert_active(&self) -> Result<(), Error> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn list_archives_in(&self, package: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .archives_in
            .lock()
            .unwrap()
            .get(package)
            .cloned()
            .unwrap_or_default())
    }

    fn is_archive_install_ok(&self, package: &str) -> Result<bool, Error> {
        Ok(*self.archive_ok.lock().unwrap().get(package).unwrap_or(&true))
    }
}

pub struct MockStorage {
    pub supports: AtomicBool,
    pub needs: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_abort: AtomicBool,
    pub started: Mutex<Vec<u32>>,
    pub aborted: Mutex<Vec<(String, bool)>>,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self {
            supports: AtomicBool::new(true),
            needs: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_abort: AtomicBool::new(false),
            started: Mutex::default(),
            aborted: Mutex::default(),
        }
    }
}

impl Storage for MockStorage {
    fn supports_checkpoint(&self) -> Result<bool, Error> {
        Ok(self.supports.load(Ordering::SeqCst))
    }

    fn needs_checkpoint(&self) -> Result<bool, Error> {
        Ok(self.needs.load(Ordering::SeqCst))
    }

    fn start_checkpoint(&self, num_retries: u32) -> Result<(), Error> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        self.started.lock().unwrap().push(num_retries);
        Ok(())
    }

    fn abort_changes(&self, reason: &str, retry: bool) -> Result<(), Error> {
        if self.fail_abort.load(Ordering::SeqCst) {
            return Err(anyhow!("abort failed"));
        }
        self.aborted.lock().unwrap().push((reason.to_owned(), retry));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRollback {
    pub next_id: AtomicI64,
    pub fail_notify: AtomicBool,
    pub committed: Mutex<Vec<RollbackInfo>>,
    pub staged_archives: Mutex<Vec<(SessionId, SessionId)>>,
    pub snapshots: Mutex<Vec<(String, i32)>>,
}

impl RollbackManager for MockRollback {
    fn notify_staged(&self, _session: SessionId) -> Result<RollbackId, Error> {
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(anyhow!("rollback manager unavailable"));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn notify_staged_archive(
        &self,
        staged: SessionId,
        archive_session: SessionId,
    ) -> Result<(), Error> {
        self.staged_archives
            .lock()
            .unwrap()
            .push((staged, archive_session));
        Ok(())
    }

    fn snapshot_and_restore_user(
        &self,
        package: &str,
        _user_ids: &[u32],
        _app_id: u32,
        _ce_data_inode: i64,
        _se_info: &str,
        token: i32,
    ) -> Result<(), Error> {
        self.snapshots.lock().unwrap().push((package.to_owned(), token));
        Ok(())
    }

    fn recently_committed(&self) -> Result<Vec<RollbackInfo>, Error> {
        Ok(self.committed.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct CreatedInstallerSession {
    pub params: SessionParams,
    pub installer: String,
    pub user_id: u32,
    pub files: Vec<String>,
    pub children: Vec<SessionId>,
}

pub struct MockInstaller {
    next_id: AtomicU32,
    pub sessions: Mutex<BTreeMap<SessionId, CreatedInstallerSession>>,
    pub committed: Mutex<Vec<SessionId>>,
    /// Status sent on the reply channel; `None` drops the reply so the
    /// caller's bounded wait expires.
    pub commit_status: Mutex<Option<CommitStatus>>,
    pub verifications: Mutex<Vec<SessionId>>,
}

impl Default for MockInstaller {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(10_000),
            sessions: Mutex::default(),
            committed: Mutex::default(),
            commit_status: Mutex::new(Some(CommitStatus::Success)),
            verifications: Mutex::default(),
        }
    }
}

impl ArchiveInstaller for MockInstaller {
    fn create_session(
        &self,
        params: &SessionParams,
        installer: &str,
        user_id: u32,
    ) -> Result<SessionId, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().insert(
            id,
            CreatedInstallerSession {
                params: params.clone(),
                installer: installer.to_owned(),
                user_id,
                files: Vec::new(),
                children: Vec::new(),
            },
        );
        Ok(id)
    }

    fn add_child(&self, parent: SessionId, child: SessionId) -> Result<(), Error> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .get_mut(&parent)
            .ok_or_else(|| anyhow!("no such installer session {parent}"))?
            .children
            .push(child);
        Ok(())
    }

    fn write(&self, session: SessionId, name: &str, _source: &Path) -> Result<(), Error> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .get_mut(&session)
            .ok_or_else(|| anyhow!("no such installer session {session}"))?
            .files
            .push(name.to_owned());
        Ok(())
    }

    fn commit(&self, session: SessionId, reply: SyncSender<CommitStatus>) -> Result<(), Error> {
        self.committed.lock().unwrap().push(session);
        if let Some(status) = self.commit_status.lock().unwrap().clone() {
            let _ = reply.send(status);
        }
        Ok(())
    }

    fn begin_verification(&self, session: &StagedSession) -> Result<(), Error> {
        self.verifications.lock().unwrap().push(session.id);
        Ok(())
    }
}

pub struct MockSignatures {
    pub parse_errors: Mutex<HashSet<PathBuf>>,
    /// When clear, `has_capability` denies everything.
    pub allow_installed_data: AtomicBool,
    pub allow_rollback: AtomicBool,
}

impl Default for MockSignatures {
    fn default() -> Self {
        Self {
            parse_errors: Mutex::default(),
            allow_installed_data: AtomicBool::new(true),
            allow_rollback: AtomicBool::new(false),
        }
    }
}

impl SignatureVerifier for MockSignatures {
    fn verify(&self, path: &Path, min_scheme: u32) -> Result<SigningDetails, Error> {
        if self.parse_errors.lock().unwrap().contains(path) {
            return Err(anyhow!("malformed signature in {}", path.display()));
        }
        Ok(SigningDetails {
            scheme_version: min_scheme,
            cert_digest: path.display().to_string(),
        })
    }

    fn has_capability(
        &self,
        _details: &SigningDetails,
        _other: &SigningDetails,
        capability: Capability,
    ) -> bool {
        match capability {
            Capability::InstalledData => self.allow_installed_data.load(Ordering::SeqCst),
            Capability::Rollback => self.allow_rollback.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
pub struct MockRegistry {
    pub active: Mutex<HashMap<String, ActivePackage>>,
    pub pruned: Mutex<Vec<String>>,
    pub deps: Mutex<HashMap<String, Vec<String>>>,
}

impl MockRegistry {
    pub fn install_active(&self, package: &str, version_code: i64) {
        self.active.lock().unwrap().insert(
            package.to_owned(),
            ActivePackage {
                package_name: package.to_owned(),
                version_code,
                debuggable: false,
                file_path: PathBuf::from(format!("/system/modules/{package}.pkg")),
                app_id: 1000,
                ce_data_inode: 0,
                se_info: "platform".to_owned(),
                user_ids: vec![0],
            },
        );
    }
}

impl PackageRegistry for MockRegistry {
    fn active_package(&self, package: &str) -> Option<ActivePackage> {
        self.active.lock().unwrap().get(package).cloned()
    }

    fn prune_archive_cache(&self, packages: &[String]) -> Result<(), Error> {
        self.pruned.lock().unwrap().extend_from_slice(packages);
        Ok(())
    }

    fn resolve_dependencies(&self, packages: &[String]) -> Vec<String> {
        let deps = self.deps.lock().unwrap();
        let mut effective: Vec<String> = packages.to_vec();
        for package in packages {
            if let Some(extra) = deps.get(package) {
                for dep in extra {
                    if !effective.contains(dep) {
                        effective.push(dep.clone());
                    }
                }
            }
        }
        effective
    }
}

type IdleWaiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct MockDeviceState {
    pub idle: AtomicBool,
    pub in_call: AtomicBool,
    pub foreground: Mutex<HashSet<String>>,
    pub interacting: Mutex<HashSet<String>>,
    pub top_visible: Mutex<HashSet<String>>,
    idle_waiters: Mutex<Vec<IdleWaiter>>,
}

impl MockDeviceState {
    /// Flip the device to idle and fire every registered idle notification.
    pub fn become_idle(&self) {
        self.idle.store(true, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.idle_waiters.lock().unwrap());
        for waiter in waiters {
            waiter();
        }
    }
}

impl DeviceState for MockDeviceState {
    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn request_idle_notification(&self, notify: IdleWaiter) {
        if self.is_idle() {
            notify();
        } else {
            self.idle_waiters.lock().unwrap().push(notify);
        }
    }

    fn is_app_foreground(&self, package: &str) -> bool {
        self.foreground.lock().unwrap().contains(package)
    }

    fn is_app_interacting(&self, package: &str) -> bool {
        self.interacting.lock().unwrap().contains(package)
    }

    fn is_app_top_visible(&self, package: &str) -> bool {
        self.top_visible.lock().unwrap().contains(package)
    }

    fn is_in_call(&self) -> bool {
        self.in_call.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockPower {
    pub reboots: Mutex<Vec<Option<String>>>,
}

impl Power for MockPower {
    fn reboot(&self, reason: Option<&str>) {
        self.reboots
            .lock()
            .unwrap()
            .push(reason.map(|r| r.to_owned()));
    }
}

pub struct MockRecorder {
    pub records: Mutex<BTreeMap<SessionId, StagedSession>>,
    pub removed: Mutex<Vec<SessionId>>,
    next_id: AtomicU32,
}

impl Default for MockRecorder {
    fn default() -> Self {
        Self {
            records: Mutex::default(),
            removed: Mutex::default(),
            next_id: AtomicU32::new(1),
        }
    }
}

impl SessionRecorder for MockRecorder {
    fn note_dirty(&self, session: &StagedSession) {
        self.records
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
    }

    fn remove(&self, id: SessionId) {
        self.records.lock().unwrap().remove(&id);
        self.removed.lock().unwrap().push(id);
    }

    fn load_all(&self) -> Result<Vec<StagedSession>, Error> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    fn allocate_session_id(&self) -> Result<SessionId, Error> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// All mocks plus the assembled `Platform` bundle.
pub struct TestPlatform {
    pub daemon: Arc<MockDaemon>,
    pub storage: Arc<MockStorage>,
    pub rollback: Arc<MockRollback>,
    pub installer: Arc<MockInstaller>,
    pub signatures: Arc<MockSignatures>,
    pub registry: Arc<MockRegistry>,
    pub device: Arc<MockDeviceState>,
    pub power: Arc<MockPower>,
}

impl Default for TestPlatform {
    fn default() -> Self {
        let platform = Self {
            daemon: Arc::default(),
            storage: Arc::default(),
            rollback: Arc::default(),
            installer: Arc::default(),
            signatures: Arc::default(),
            registry: Arc::default(),
            device: Arc::default(),
            power: Arc::default(),
        };
        platform.daemon.supported.store(true, Ordering::SeqCst);
        platform
    }
}

impl TestPlatform {
    pub fn platform(&self) -> Platform {
        Platform {
            daemon: self.daemon.clone(),
            storage: self.storage.clone(),
            rollback: self.rollback.clone(),
            installer: self.installer.clone(),
            signatures: self.signatures.clone(),
            registry: self.registry.clone(),
            device: self.device.clone(),
            power: self.power.clone(),
        }
    }
}
