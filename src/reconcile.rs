//! Boot-time reconciliation. Every persisted root session is classified on
//! process start: terminal sessions are skipped, destroyed ones abandoned,
//! interrupted ones re-verified, and ready ones applied against what the
//! module daemon and the filesystem checkpoint actually did across the
//! reboot.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use anyhow::Error;
use log::{debug, error, info, warn};

use airlock_api::{
    session::{FailureCode, InstallFlag, InstallReason, SessionState, SessionTree},
    SessionId,
};

use crate::archive;
use crate::journal::FailureJournal;
use crate::platform::{Platform, StagedDaemonState};
use crate::store::SessionStore;
use crate::verify::Verifier;

pub struct Reconciler {
    store: Arc<SessionStore>,
    platform: Platform,
    journal: Arc<FailureJournal>,
    verifier: Arc<Verifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<SessionStore>,
        platform: Platform,
        journal: Arc<FailureJournal>,
        verifier: Arc<Verifier>,
    ) -> Self {
        Self {
            store,
            platform,
            journal,
            verifier,
        }
    }

    /// Reconcile every persisted root session. Returns the sessions whose
    /// "successful" notification to the daemon is deferred until the boot
    /// completes.
    #[tracing::instrument(skip_all)]
    pub fn run(&self) -> Vec<SessionId> {
        let supports_checkpoint = self.supports_checkpoint();
        let in_checkpoint_mode = self.in_checkpoint_mode();
        let mut deferred = Vec::new();

        for root in self.store.roots() {
            let id = root.id;
            if root.state.is_terminal() {
                debug!("Session {id} already {:?}, skipping", root.state);
                continue;
            }
            let Some(tree) = self.store.tree(id) else {
                continue;
            };

            if root.destroyed {
                info!("Session {id} was destroyed, abandoning");
                abandon_session(&self.store, &self.platform, &tree);
                continue;
            }

            if root.state != SessionState::Ready {
                if root.state == SessionState::Created {
                    debug!("Session {id} was never committed, leaving it alone");
                    continue;
                }
                info!("Session {id} interrupted mid-verification, re-verifying");
                self.verifier.enqueue(id);
                continue;
            }

            if let Some(session) =
                self.apply(&tree, supports_checkpoint, in_checkpoint_mode)
            {
                deferred.push(session);
            }
        }

        deferred
    }

    /// Apply one ready session. Returns the session id when the success
    /// callback to the daemon must wait for boot completion.
    fn apply(
        &self,
        tree: &SessionTree,
        supports_checkpoint: bool,
        in_checkpoint_mode: bool,
    ) -> Option<SessionId> {
        let id = tree.id();
        info!("Applying staged session {id}");

        let daemon_info = if tree.contains_module() {
            match self.platform.daemon.staged_info(id) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Failed to query module daemon for session {id}: {e:?}");
                    None
                }
            }
        } else {
            None
        };

        let crash_token = daemon_info.as_ref().and_then(|i| i.crash_token.clone());
        if let Some(token) = &crash_token {
            self.journal
                .record(id, &format!("native crash during activation: {token}"));
        }

        // An interrupted reboot: the daemon verified the session but never
        // activated it. Verification starts over.
        if daemon_info.as_ref().map(|i| i.state) == Some(StagedDaemonState::Verified) {
            info!("Session {id} verified but not activated, re-verifying");
            if self.store.set_state(id, SessionState::Verifying).is_ok() {
                self.verifier.enqueue(id);
            }
            return None;
        }

        // Checkpoint supported but no longer active: the filesystem already
        // rolled back the provisional writes of this boot attempt.
        if supports_checkpoint && !in_checkpoint_mode {
            let message = match self.journal.read() {
                Some(reason) => format!("reverting to safe state: {reason}"),
                None => "reverting to safe state".to_owned(),
            };
            self.store.fail_session(id, FailureCode::Unknown, message);
            return None;
        }

        if tree.contains_module() {
            let failure = match daemon_info {
                None => Some("module daemon has no record of the session".to_owned()),
                Some(info) => match info.state {
                    StagedDaemonState::Activated | StagedDaemonState::Success => None,
                    StagedDaemonState::ActivationFailed
                    | StagedDaemonState::Unknown
                    | StagedDaemonState::Reverted
                    | StagedDaemonState::RevertInProgress
                    | StagedDaemonState::RevertFailed => {
                        Some("module activation failed".to_owned())
                    }
                    StagedDaemonState::Verified => unreachable!("handled above"),
                },
            };
            if let Some(mut message) = failure {
                if let Some(token) = &crash_token {
                    message = format!("{message}: {token}");
                }
                self.fail_and_abort_checkpoint(id, FailureCode::ActivationFailed, &message);
                return None;
            }
        }

        let embedded = match self.check_archives_in_modules(tree) {
            Ok(embedded) => embedded,
            Err(message) => {
                self.fail_and_abort_checkpoint(id, FailureCode::ActivationFailed, &message);
                return None;
            }
        };

        self.snapshot_user_data(tree, &embedded);

        if let Err(e) = archive::install_archives(&self.platform, tree) {
            self.fail_and_abort_checkpoint(
                id,
                FailureCode::ActivationFailed,
                &format!("{e:#}"),
            );
            return None;
        }

        if self.store.set_state(id, SessionState::Applied).is_err() {
            return None;
        }
        for child in &tree.root.children {
            let _ = self.store.set_state(*child, SessionState::Applied);
        }
        info!("Session {id} applied");
        tracing::info!(metric_name = "staged_session_applied", session = id);

        if !tree.contains_module() {
            return None;
        }
        if supports_checkpoint {
            // The checkpoint only commits once the boot completes; the
            // daemon hears about success at that point.
            Some(id)
        } else {
            if let Err(e) = self.platform.daemon.mark_successful(id) {
                warn!("Failed to mark session {id} successful at the daemon: {e:?}");
            }
            None
        }
    }

    /// An archive embedded in an activated module must not collide with an
    /// archive the session installs directly. Returns the embedded archive
    /// package names for the rollback snapshot pass.
    fn check_archives_in_modules(&self, tree: &SessionTree) -> Result<Vec<String>, String> {
        let mut seen: HashSet<String> = tree
            .archive_children()
            .iter()
            .filter_map(|s| s.params.package_name.clone())
            .collect();
        let mut embedded = Vec::new();

        for module in tree.module_children() {
            let Some(package) = module.params.package_name.as_deref() else {
                continue;
            };
            let archives = match self.platform.daemon.list_archives_in(package) {
                Ok(archives) => archives,
                Err(e) => {
                    warn!("Failed to list archives in module '{package}': {e:?}");
                    continue;
                }
            };
            for archive in archives {
                if !seen.insert(archive.clone()) {
                    return Err(format!(
                        "duplicate archive in module: '{archive}' in '{package}'"
                    ));
                }
                embedded.push(archive);
            }
        }
        Ok(embedded)
    }

    /// Snapshot-and-restore user data for every module and every archive
    /// embedded in one, when the session enabled rollback or is itself a
    /// rollback. Rollback failures never block the apply.
    fn snapshot_user_data(&self, tree: &SessionTree, embedded: &[String]) {
        let params = &tree.root.params;
        if !params.flags.contains(InstallFlag::EnableRollback)
            && params.reason != InstallReason::Rollback
        {
            return;
        }

        let token = tree.root.rollback_id.unwrap_or(0) as i32;
        let module_children = tree.module_children();
        let packages = module_children
            .iter()
            .filter_map(|s| s.params.package_name.clone())
            .chain(embedded.iter().cloned());

        for package in packages {
            let Some(active) = self.platform.registry.active_package(&package) else {
                debug!("No active package '{package}' to snapshot");
                continue;
            };
            if let Err(e) = self.platform.rollback.snapshot_and_restore_user(
                &package,
                &active.user_ids,
                active.app_id,
                active.ce_data_inode,
                &active.se_info,
                token,
            ) {
                warn!("Failed to snapshot user data of '{package}': {e:?}");
            }
        }
    }

    /// Record the failure, fail the session, and walk the device out of the
    /// checkpoint so this boot's provisional writes are discarded.
    fn fail_and_abort_checkpoint(&self, id: SessionId, code: FailureCode, message: &str) {
        self.journal.record(id, message);
        self.store.fail_session(id, code, message);
        tracing::info!(metric_name = "staged_session_revert", session = id);

        if !(self.supports_checkpoint() && self.in_checkpoint_mode()) {
            return;
        }

        let result = (|| -> Result<(), Error> {
            if self.platform.daemon.is_supported() {
                self.platform.daemon.revert_active()?;
            }
            self.platform.storage.abort_changes(message, false)?;
            Ok(())
        })();

        if let Err(e) = result {
            error!("Failed to abort checkpoint cleanly: {e:?}; forcing a reboot");
            let _ = self.platform.daemon.revert_active();
            self.platform.power.reboot(Some("session-revert"));
        }
    }

    fn supports_checkpoint(&self) -> bool {
        self.platform.storage.supports_checkpoint().unwrap_or_else(|e| {
            warn!("Storage query 'supports_checkpoint' failed: {e:?}");
            false
        })
    }

    fn in_checkpoint_mode(&self) -> bool {
        self.platform.storage.needs_checkpoint().unwrap_or_else(|e| {
            warn!("Storage query 'needs_checkpoint' failed: {e:?}");
            false
        })
    }
}

/// Tear down a destroyed session: best-effort abort at the daemon, staging
/// directories removed, records dropped from the store.
pub(crate) fn abandon_session(store: &SessionStore, platform: &Platform, tree: &SessionTree) {
    let id = tree.id();
    if tree.contains_module() {
        if let Err(e) = platform.daemon.abort_staged(id) {
            warn!("Failed to abort module session {id} at the daemon: {e:?}");
        }
    }

    for session in std::iter::once(&tree.root).chain(tree.children.iter()) {
        if let Some(staging_dir) = &session.params.staging_dir {
            if let Err(e) = fs::remove_dir_all(staging_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove staging directory {}: {e}",
                        staging_dir.display()
                    );
                }
            }
        }
    }

    for child in &tree.children {
        store.abort(child.id);
    }
    store.abort(id);
}
