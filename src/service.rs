//! The public face of the staged install core: session creation, commit,
//! abort, boot-time restore and reconciliation, the archive-verifier
//! callback, and constraint checks. One instance owns the session store,
//! both workers, and the failure journal.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use enumflags2::BitFlags;
use log::{info, warn};

use airlock_api::{
    constraints::InstallConstraint,
    error::{
        AirlockError, CommitError, DatastoreError, InitializationError, ReportError,
    },
    session::{FailureCode, SessionParams, SessionState, StagedSession},
    SessionId,
};

use crate::conflict;
use crate::constraints::{ConstraintFuture, ConstraintWaiter};
use crate::journal::FailureJournal;
use crate::platform::{Platform, SessionRecorder};
use crate::progress::{InstallObserver, Observers};
use crate::reconcile::{abandon_session, Reconciler};
use crate::store::SessionStore;
use crate::verify::Verifier;

pub struct StagedInstallService {
    store: Arc<SessionStore>,
    platform: Platform,
    recorder: Arc<dyn SessionRecorder>,
    verifier: Arc<Verifier>,
    waiter: ConstraintWaiter,
    journal: Arc<FailureJournal>,
    observers: Arc<Observers>,
    /// Sessions applied under an active checkpoint; the daemon hears about
    /// their success only once the boot completes.
    deferred_success: Mutex<Vec<SessionId>>,
    boot_completed: AtomicBool,
}

impl StagedInstallService {
    pub fn new(
        platform: Platform,
        recorder: Arc<dyn SessionRecorder>,
        journal_path: impl Into<PathBuf>,
    ) -> Result<Self, AirlockError> {
        let observers = Arc::new(Observers::default());
        let store = Arc::new(SessionStore::new(recorder.clone(), observers.clone()));
        let verifier = Arc::new(Verifier::spawn(store.clone(), platform.clone())?);
        let waiter = ConstraintWaiter::spawn(platform.clone())?;
        Ok(Self {
            store,
            platform,
            recorder,
            verifier,
            waiter,
            journal: Arc::new(FailureJournal::new(journal_path)),
            observers,
            deferred_success: Mutex::default(),
            boot_completed: AtomicBool::new(false),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn InstallObserver>) {
        self.observers.register(observer);
    }

    /// Restore persisted sessions and reconcile them against what actually
    /// happened across the reboot. `device_upgrading` is set when the build
    /// fingerprint changed since the sessions were staged.
    #[tracing::instrument(skip_all)]
    pub fn start(&self, device_upgrading: bool) -> Result<(), AirlockError> {
        let sessions = self
            .recorder
            .load_all()
            .structured(InitializationError::RestoreSessions)?;
        info!("Restoring {} persisted session(s)", sessions.len());
        for session in sessions {
            self.restore_session(session, device_upgrading);
        }

        let reconciler = Reconciler::new(
            self.store.clone(),
            self.platform.clone(),
            self.journal.clone(),
            self.verifier.clone(),
        );
        let deferred = reconciler.run();
        *self.deferred_success.lock().unwrap() = deferred;
        Ok(())
    }

    /// Insert a fresh session in the `Created` state and hand back its id.
    pub fn create_session(&self, params: SessionParams) -> Result<SessionId, AirlockError> {
        let id = self
            .recorder
            .allocate_session_id()
            .structured(DatastoreError::AllocateSessionId)?;
        self.store.create(StagedSession::new(id, params))?;
        info!("Created staged session {id}");
        Ok(id)
    }

    /// Commit a root session: run the conflict check, then enter it into the
    /// pre-reboot verification pipeline. Re-committing a session that is
    /// already verifying or ready is a no-op.
    #[tracing::instrument(skip_all, fields(session = id))]
    pub fn commit_session(&self, id: SessionId) -> Result<(), AirlockError> {
        let tree = self
            .store
            .tree(id)
            .ok_or_else(|| AirlockError::new(CommitError::SessionNotFound { id }))?;
        if tree.root.parent().is_some() {
            return Err(AirlockError::new(CommitError::NotCommittable {
                id,
                state: "child",
            }));
        }
        match tree.root.state {
            SessionState::Created => {}
            SessionState::Verifying | SessionState::Ready => return Ok(()),
            state => {
                return Err(AirlockError::new(CommitError::NotCommittable {
                    id,
                    state: state.into(),
                }))
            }
        }

        conflict::enforce_non_overlapping(&self.store, &self.platform, &tree)?;

        self.store.set_state(id, SessionState::Verifying)?;
        for child in &tree.root.children {
            let _ = self.store.set_state(*child, SessionState::Verifying);
        }
        self.verifier.enqueue(id);
        info!("Committed staged session {id}");
        Ok(())
    }

    /// Remove a session (and its children) from the store. The caller has
    /// already moved it to a terminal or destroyed state.
    pub fn abort_session(&self, id: SessionId) {
        if let Some(tree) = self.store.tree(id) {
            for child in &tree.children {
                self.store.abort(child.id);
            }
        }
        self.store.abort(id);
    }

    /// Mark a session and its children destroyed. Cleanup then aborts it.
    pub fn destroy_session(&self, id: SessionId) -> Result<(), AirlockError> {
        let tree = self
            .store
            .tree(id)
            .ok_or_else(|| AirlockError::new(CommitError::SessionNotFound { id }))?;
        self.store.mark_destroyed(id)?;
        for child in &tree.root.children {
            let _ = self.store.mark_destroyed(*child);
        }
        Ok(())
    }

    /// Abort a committed session: requires the caller to have destroyed it
    /// first. A ready session is also withdrawn from the module daemon,
    /// best-effort, and its staging directories are removed.
    pub fn abort_committed_session(&self, id: SessionId) -> Result<(), AirlockError> {
        let tree = self
            .store
            .tree(id)
            .ok_or_else(|| AirlockError::new(CommitError::SessionNotFound { id }))?;
        if !tree.root.destroyed {
            return Err(AirlockError::new(CommitError::NotDestroyed { id }));
        }
        info!("Aborting committed session {id}");
        abandon_session(&self.store, &self.platform, &tree);
        Ok(())
    }

    /// Boot-path restore of one persisted session.
    pub fn restore_session(&self, session: StagedSession, device_upgrading: bool) {
        self.store.restore(session, device_upgrading);
    }

    /// Callback from the archive installer: the archive portion of the
    /// session passed verification.
    pub fn notify_verification_complete(&self, id: SessionId) {
        self.verifier.notify_verification_complete(id);
    }

    /// Callback from the archive installer: the archive portion was
    /// rejected.
    pub fn notify_verification_failed(&self, id: SessionId, message: &str) {
        if let Some(tree) = self.store.tree(id) {
            if tree.contains_module() {
                if let Err(e) = self.platform.daemon.abort_staged(id) {
                    warn!("Failed to abort module session {id} at the daemon: {e:?}");
                }
            }
        }
        self.store
            .fail_session(id, FailureCode::VerificationFailed, message);
    }

    /// Park an install request until the given constraints hold or the
    /// timeout expires.
    pub fn check_install_constraints(
        &self,
        packages: &[String],
        constraints: BitFlags<InstallConstraint>,
        timeout_ms: i64,
    ) -> Result<ConstraintFuture, AirlockError> {
        self.waiter
            .check_constraints(packages, constraints, timeout_ms)
    }

    /// The boot completed cleanly: deliver deferred success notifications,
    /// emit telemetry for modules whose embedded archives misbehaved, and
    /// drop the failure journal. Runs at most once per process.
    pub fn on_boot_completed(&self) {
        if self.boot_completed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Boot completed, finalizing applied sessions");

        let deferred = std::mem::take(&mut *self.deferred_success.lock().unwrap());
        for id in deferred {
            if let Err(e) = self.platform.daemon.mark_successful(id) {
                warn!("Failed to mark session {id} successful at the daemon: {e:?}");
            }
            if let Some(tree) = self.store.tree(id) {
                for module in tree.module_children() {
                    let Some(package) = module.params.package_name.as_deref() else {
                        continue;
                    };
                    match self.platform.daemon.is_archive_install_ok(package) {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("Archives embedded in module '{package}' failed to install");
                            tracing::info!(
                                metric_name = "module_archive_install_failed",
                                package = package
                            );
                        }
                        Err(e) => warn!(
                            "Failed to query archive install state of '{package}': {e:?}"
                        ),
                    }
                }
            }
        }

        if let Some(reason) = self.journal.read() {
            tracing::info!(metric_name = "staged_session_reverted_last_boot", reason = reason);
        }
        self.journal.clear();
    }

    pub fn session(&self, id: SessionId) -> Option<StagedSession> {
        self.store.get(id)
    }
}
