//! Pre-reboot verification. A single dedicated worker drives every
//! committed session through four pipeline stages (Start, Modules,
//! Archives, End); all state transitions for a session happen on that
//! worker, in pipeline order. Callers post a message and observe completion
//! through the session's state.

use std::sync::{
    mpsc::{self, Receiver, Sender},
    Arc,
};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use airlock_api::{
    error::{AirlockError, InternalError, ReportError},
    session::{FailureCode, InstallFlag, InstallReason, SessionState, SessionTree},
    SessionId,
};

use crate::platform::{
    min_scheme_for_sdk, ActivePackage, Capability, ModuleInfo, ModuleSubmission, Platform,
    BASELINE_SIGNATURE_SCHEME,
};
use crate::store::SessionStore;

enum VerifyMsg {
    Start(SessionId),
    Modules(SessionId),
    Archives(SessionId),
    End(SessionId),
    Shutdown,
}

/// Handle to the verification worker. Dropping it drains the queue and
/// joins the worker thread.
pub struct Verifier {
    tx: Sender<VerifyMsg>,
    handle: Option<JoinHandle<()>>,
}

impl Verifier {
    pub fn spawn(store: Arc<SessionStore>, platform: Platform) -> Result<Self, AirlockError> {
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            store,
            platform,
            tx: tx.clone(),
        };
        let handle = thread::Builder::new()
            .name("airlock-verifier".to_owned())
            .spawn(move || worker.run(rx))
            .structured(InternalError::Internal("failed to spawn verifier worker"))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Enter a freshly committed session into the pipeline.
    pub fn enqueue(&self, session: SessionId) {
        let _ = self.tx.send(VerifyMsg::Start(session));
    }

    /// Archive verification finished; resume the pipeline at its final
    /// stage.
    pub fn notify_verification_complete(&self, session: SessionId) {
        let _ = self.tx.send(VerifyMsg::End(session));
    }
}

impl Drop for Verifier {
    fn drop(&mut self) {
        let _ = self.tx.send(VerifyMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    store: Arc<SessionStore>,
    platform: Platform,
    tx: Sender<VerifyMsg>,
}

impl Worker {
    fn run(&self, rx: Receiver<VerifyMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                VerifyMsg::Start(id) => self.stage(id, Self::on_start),
                VerifyMsg::Modules(id) => self.stage(id, Self::on_modules),
                VerifyMsg::Archives(id) => self.stage(id, Self::on_archives),
                VerifyMsg::End(id) => self.stage(id, Self::on_end),
                VerifyMsg::Shutdown => break,
            }
        }
    }

    /// Stage entry: resolve a fresh snapshot and observe destruction. A
    /// destroyed session short-circuits to completion without further
    /// collaborator calls.
    fn stage(&self, id: SessionId, f: impl FnOnce(&Self, &SessionTree)) {
        let Some(tree) = self.store.tree(id) else {
            debug!("Session {id} disappeared mid-verification");
            return;
        };
        if tree.root.destroyed {
            debug!("Session {id} destroyed, completing verification early");
            return;
        }
        if tree.root.state != SessionState::Verifying {
            debug!(
                "Ignoring verification message for session {id} in state '{:?}'",
                tree.root.state
            );
            return;
        }
        f(self, &tree)
    }

    /// Stage 1: resolve the rollback id.
    fn on_start(&self, tree: &SessionTree) {
        let id = tree.id();
        debug!("Starting pre-reboot verification of session {id}");

        if tree.root.params.flags.contains(InstallFlag::EnableRollback) {
            // A runtime failure here only costs the rollback, not the
            // install.
            match self.platform.rollback.notify_staged(id) {
                Ok(rollback_id) => {
                    let _ = self.store.update(id, |s| s.rollback_id = Some(rollback_id));
                }
                Err(e) => warn!("Failed to enable rollback for session {id}: {e:?}"),
            }
        }

        if tree.root.params.reason == InstallReason::Rollback {
            match self.committed_rollback_id(tree) {
                Some(rollback_id) => {
                    let _ = self.store.update(id, |s| s.rollback_id = Some(rollback_id));
                }
                None => {
                    self.fail(tree, FailureCode::VerificationFailed, "no rollback id");
                    return;
                }
            }
        }

        let _ = self.tx.send(VerifyMsg::Modules(id));
    }

    fn committed_rollback_id(&self, tree: &SessionTree) -> Option<i64> {
        let committed = match self.platform.rollback.recently_committed() {
            Ok(committed) => committed,
            Err(e) => {
                warn!("Failed to query committed rollbacks: {e:?}");
                return None;
            }
        };
        let packages: Vec<&str> = tree
            .module_children()
            .iter()
            .chain(tree.archive_children().iter())
            .filter_map(|s| s.params.package_name.as_deref())
            .collect();
        committed
            .iter()
            .find(|info| info.packages.iter().any(|p| packages.contains(&p.as_str())))
            .map(|info| info.rollback_id)
    }

    /// Stage 2: submit the module portion to the daemon and vet every
    /// descriptor it returns.
    fn on_modules(&self, tree: &SessionTree) {
        let id = tree.id();
        if !tree.contains_module() {
            let _ = self.tx.send(VerifyMsg::Archives(id));
            return;
        }

        let root = self.store.get(id);
        let submission = ModuleSubmission {
            session_id: id,
            children: tree
                .module_children()
                .iter()
                .filter(|s| s.id != id)
                .map(|s| s.id)
                .collect(),
            is_rollback: tree.root.params.reason == InstallReason::Rollback,
            rollback_id: root.and_then(|s| s.rollback_id),
        };

        let infos = match self.platform.daemon.submit(&submission) {
            Ok(infos) => infos,
            Err(e) => {
                self.fail(
                    tree,
                    FailureCode::VerificationFailed,
                    format!("Module daemon rejected the session: {e}"),
                );
                return;
            }
        };

        for info in &infos {
            let Some(active) = self.platform.registry.active_package(&info.package_name)
            else {
                self.fail(
                    tree,
                    FailureCode::VerificationFailed,
                    format!(
                        "Installing new modules is not allowed: '{}' has no active counterpart",
                        info.package_name
                    ),
                );
                return;
            };

            if let Some(required) = tree.root.params.required_installed_version {
                if required != active.version_code {
                    self.fail(
                        tree,
                        FailureCode::VerificationFailed,
                        format!(
                            "Installed version of '{}' is {}, required {}",
                            info.package_name, active.version_code, required
                        ),
                    );
                    return;
                }
            }

            if info.version_code < active.version_code
                && !tree.root.params.flags.contains(InstallFlag::AllowDowngrade)
                && !active.debuggable
            {
                self.fail(
                    tree,
                    FailureCode::VerificationFailed,
                    format!(
                        "Downgrade of module '{}' from {} to {} is not allowed",
                        info.package_name, active.version_code, info.version_code
                    ),
                );
                return;
            }

            if !self.check_signature(tree, info, &active) {
                return;
            }
        }

        let updated: Vec<String> = infos.iter().map(|i| i.package_name.clone()).collect();
        if let Err(e) = self.platform.registry.prune_archive_cache(&updated) {
            warn!("Failed to prune archive caches for updated modules: {e:?}");
        }

        let _ = self.tx.send(VerifyMsg::Archives(id));
    }

    fn check_signature(&self, tree: &SessionTree, info: &ModuleInfo, active: &ActivePackage) -> bool {
        let signatures = &self.platform.signatures;
        let new_details = match signatures.verify(
            &info.file_path,
            min_scheme_for_sdk(info.target_sdk),
        ) {
            Ok(details) => details,
            Err(e) => {
                self.fail(
                    tree,
                    FailureCode::VerificationFailed,
                    format!("Failed to parse signature of '{}': {e}", info.package_name),
                );
                return false;
            }
        };
        let active_details =
            match signatures.verify(&active.file_path, BASELINE_SIGNATURE_SCHEME) {
                Ok(details) => details,
                Err(e) => {
                    self.fail(
                        tree,
                        FailureCode::VerificationFailed,
                        format!(
                            "Failed to parse active signature of '{}': {e}",
                            info.package_name
                        ),
                    );
                    return false;
                }
            };

        let compatible = signatures.has_capability(
            &new_details,
            &active_details,
            Capability::InstalledData,
        ) || signatures.has_capability(&active_details, &new_details, Capability::Rollback);
        if !compatible {
            self.fail(
                tree,
                FailureCode::VerificationFailed,
                format!("Module '{}' has an incompatible signature", info.package_name),
            );
            return false;
        }
        true
    }

    /// Stage 3: hand the archive portion to the installer. Its completion
    /// callback re-enters the pipeline at the final stage.
    fn on_archives(&self, tree: &SessionTree) {
        let id = tree.id();
        if !tree.contains_archive() {
            let _ = self.tx.send(VerifyMsg::End(id));
            return;
        }

        debug!("Delegating archive verification of session {id} to the installer");
        if let Err(e) = self.platform.installer.begin_verification(&tree.root) {
            self.fail(
                tree,
                FailureCode::VerificationFailed,
                format!("Failed to start archive verification: {e}"),
            );
        }
    }

    /// Stage 4: arm the filesystem checkpoint and mark the session ready.
    fn on_end(&self, tree: &SessionTree) {
        let id = tree.id();

        let checkpoint_armed = self
            .platform
            .storage
            .supports_checkpoint()
            .and_then(|supported| {
                if supported {
                    self.platform.storage.start_checkpoint(1)?;
                }
                Ok(())
            });
        if let Err(e) = checkpoint_armed {
            warn!("Failed to arm filesystem checkpoint for session {id}: {e:?}");
            self.fail(tree, FailureCode::Unknown, "no storage");
            return;
        }

        // The session must read as ready locally before the daemon hears of
        // it: a reboot in the gap leaves the daemon inactive and the boot
        // reconciler fails the session, whereas the inverse order could
        // activate modules whose archives were never committed.
        if self.store.set_state(id, SessionState::Ready).is_err() {
            return;
        }

        if tree.contains_module() {
            if let Err(e) = self.platform.daemon.mark_ready(id) {
                self.fail(
                    tree,
                    FailureCode::VerificationFailed,
                    format!("Failed to stage session in the module daemon: {e}"),
                );
                return;
            }
        }

        info!("Session {id} verified and ready to apply on next boot");
        tracing::info!(metric_name = "staged_session_ready", session = id);
    }

    /// Common failure path for every stage: make sure the daemon drops any
    /// in-progress module session, then record the failure. The worker is
    /// free for the next message as soon as this returns.
    fn fail(&self, tree: &SessionTree, code: FailureCode, message: impl Into<String>) {
        let id = tree.id();
        if tree.contains_module() {
            if let Err(e) = self.platform.daemon.abort_staged(id) {
                warn!("Failed to abort module session {id} at the daemon: {e:?}");
            }
        }
        self.store.fail_session(id, code, message);
        tracing::info!(metric_name = "pre_reboot_verification_failed", session = id);
    }
}
