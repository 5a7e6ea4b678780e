//! Re-materializes the archive portion of a ready staged session as an
//! ordinary, non-staged install at boot. Module payloads were already
//! activated by the daemon; only the archives flow back through the
//! installer here.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};

use airlock_api::{
    session::{InstallFlag, InstallReason, SessionParams, SessionTree, StagedSession},
    SessionId,
};

use crate::platform::{CommitStatus, Platform};

/// Ordinary application archives staged for install carry this suffix.
pub const ARCHIVE_SUFFIX: &str = ".pkg";

/// Bounded wait for the installer to answer a synchronous commit.
const ARCHIVE_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchiveInstallOutcome {
    Installed,
    /// The session had no archive portion.
    NothingToDo,
}

/// Install the archive portion of a ready session through the ordinary
/// installer and wait for its commit result.
pub fn install_archives(
    platform: &Platform,
    tree: &SessionTree,
) -> Result<ArchiveInstallOutcome, Error> {
    let archives = tree.archive_children();
    if archives.is_empty() {
        debug!("Session {} has no archive portion", tree.id());
        return Ok(ArchiveInstallOutcome::NothingToDo);
    }

    info!(
        "Installing archive portion of session {} ({} package(s))",
        tree.id(),
        archives.len()
    );

    if tree.root.is_multi() {
        let parent = platform
            .installer
            .create_session(
                &derive_params(&tree.root.params),
                &tree.root.params.installer,
                tree.root.params.user_id,
            )
            .context("Failed to create wrapper installer session")?;
        for child in &archives {
            let session = stage_one(platform, child)?;
            platform
                .installer
                .add_child(parent, session)
                .context("Failed to attach archive child")?;
        }
        notify_rollback(platform, &tree.root, parent);
        commit_and_wait(platform, parent, ARCHIVE_COMMIT_TIMEOUT)?;
    } else {
        let session = stage_one(platform, &tree.root)?;
        notify_rollback(platform, &tree.root, session);
        commit_and_wait(platform, session, ARCHIVE_COMMIT_TIMEOUT)?;
    }

    Ok(ArchiveInstallOutcome::Installed)
}

/// Create one non-staged installer session and feed it every archive file
/// from the staged session's staging directory.
fn stage_one(platform: &Platform, staged: &StagedSession) -> Result<SessionId, Error> {
    let staging_dir = staged
        .params
        .staging_dir
        .as_deref()
        .with_context(|| format!("Session {} has no staging directory", staged.id))?;
    let files = find_archives(staging_dir)?;

    let session = platform
        .installer
        .create_session(
            &derive_params(&staged.params),
            &staged.params.installer,
            staged.params.user_id,
        )
        .context("Failed to create installer session")?;

    for file in &files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Unrepresentable file name in {}", staging_dir.display()))?;
        platform
            .installer
            .write(session, name, file)
            .with_context(|| format!("Failed to write '{name}'"))?;
    }

    Ok(session)
}

/// Parameters of the re-materialized install: same request, but applied now
/// rather than staged, and already verified before the reboot.
fn derive_params(params: &SessionParams) -> SessionParams {
    let mut derived = params.clone();
    derived.flags.remove(InstallFlag::Staged);
    derived.flags |= InstallFlag::StagedInstall | InstallFlag::DisableVerification;
    derived.parent = None;
    derived
}

/// All files in the staging directory whose lowercased name carries the
/// archive suffix. A staged archive session with none is corrupt.
fn find_archives(staging_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut archives: Vec<PathBuf> = fs::read_dir(staging_dir)
        .with_context(|| format!("Failed to list {}", staging_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_lowercase().ends_with(ARCHIVE_SUFFIX))
        })
        .collect();
    archives.sort();

    if archives.is_empty() {
        bail!("No archive files found in {}", staging_dir.display());
    }
    Ok(archives)
}

fn notify_rollback(platform: &Platform, staged: &StagedSession, archive_session: SessionId) {
    if !staged.params.flags.contains(InstallFlag::EnableRollback)
        && staged.params.reason != InstallReason::Rollback
    {
        return;
    }
    if let Err(e) = platform
        .rollback
        .notify_staged_archive(staged.id, archive_session)
    {
        warn!(
            "Failed to link archive session {archive_session} to staged session {}: {e:?}",
            staged.id
        );
    }
}

fn commit_and_wait(
    platform: &Platform,
    session: SessionId,
    timeout: Duration,
) -> Result<(), Error> {
    let (reply, result) = mpsc::sync_channel(1);
    platform
        .installer
        .commit(session, reply)
        .context("Failed to commit installer session")?;

    match result.recv_timeout(timeout) {
        Ok(CommitStatus::Success) => Ok(()),
        Ok(CommitStatus::Failure(message)) => bail!("Archive install failed: {message}"),
        Err(_) => bail!("Timed out waiting for archive commit of session {session}"),
    }
}
