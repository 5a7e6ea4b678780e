//! Non-overlap rules between a session being committed and the sessions
//! already staged. Runs synchronously under the committer, reading one
//! consistent snapshot of the store.

use log::{info, warn};

use airlock_api::{
    error::{AirlockError, CommitError, PlatformError, ReportError},
    session::{FailureCode, InstallReason, SessionTree, StagedSession},
};

use crate::platform::Platform;
use crate::store::SessionStore;

/// Check a newly committed session tree against every currently-staged
/// session. A same-package rollback preempts the session it collides with;
/// every other collision is surfaced to the committer.
pub fn enforce_non_overlapping(
    store: &SessionStore,
    platform: &Platform,
    tree: &SessionTree,
) -> Result<(), AirlockError> {
    let supports_checkpoint = platform
        .storage
        .supports_checkpoint()
        .structured(PlatformError::Storage {
            op: "supports_checkpoint",
        })?;

    let is_rollback = tree.root.params.reason == InstallReason::Rollback;
    let staged = store.list_committed();

    for unit in units(tree) {
        let package = unit.params.package_name.as_deref().ok_or_else(|| {
            AirlockError::new(CommitError::PackageNameMissing { id: unit.id })
        })?;

        for other in &staged {
            // Wrappers carry no payload of their own; their children are
            // checked individually.
            if other.is_multi() {
                continue;
            }
            // Skip children whose parent is no longer a live staged session.
            if let Some(parent) = other.parent() {
                match store.get(parent) {
                    Some(parent) if !parent.destroyed && !parent.state.is_terminal() => {}
                    _ => continue,
                }
            }
            if other.id == unit.id {
                continue;
            }

            if other.params.package_name.as_deref() == Some(package) {
                let other_is_rollback = other.params.reason == InstallReason::Rollback;
                if is_rollback && !other_is_rollback {
                    preempt(store, platform, other, package);
                    continue;
                }
                return Err(AirlockError::new(CommitError::OtherStagedInProgress {
                    package: package.to_owned(),
                    other: other.id,
                }));
            }

            if !supports_checkpoint
                && store.root_of(other.id) != Some(tree.root.id)
            {
                return Err(AirlockError::new(CommitError::MultipleStagedRoots));
            }
        }
    }

    Ok(())
}

/// A committed rollback takes precedence over a staged session for the same
/// package: the older session's whole tree is failed and its module session
/// is aborted at the daemon.
fn preempt(store: &SessionStore, platform: &Platform, other: &StagedSession, package: &str) {
    let root = store.root_of(other.id).unwrap_or(other.id);
    info!(
        "Session {root} for package '{package}' blocked by an incoming rollback"
    );
    store.fail_session(
        root,
        FailureCode::Conflict,
        format!("blocked rollback: session for '{package}' was preempted"),
    );
    if let Err(e) = platform.daemon.abort_staged(root) {
        warn!("Failed to abort module session {root} at the daemon: {e:?}");
    }
}

/// The non-parent sessions of a tree: the root itself for a single-package
/// session, otherwise the children.
fn units(tree: &SessionTree) -> Vec<&StagedSession> {
    if tree.root.is_multi() {
        tree.children.iter().collect()
    } else {
        vec![&tree.root]
    }
}
