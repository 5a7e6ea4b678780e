//! The failure-reason journal: a single-line file that survives the reboot
//! which reverts a failed apply, so the reason can be reported after the
//! device comes back up. Written during boot-time apply, read once at
//! process start, deleted on clean system-ready.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use airlock_api::SessionId;

pub struct FailureJournal {
    path: PathBuf,
}

impl FailureJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record why a session's apply was abandoned. Only the first failure of
    /// a boot attempt is kept; later writes are ignored.
    pub fn record(&self, session: SessionId, reason: &str) {
        if self.path.exists() {
            debug!("Failure journal already holds an earlier failure, not overwriting");
            return;
        }
        let line = format!("Failed to install session {session}: {reason}");
        if let Err(e) = self.write_line(&line) {
            warn!("Failed to write failure journal: {e:?}");
        } else {
            info!("Recorded failure for session {session} in journal");
        }
    }

    fn write_line(&self, line: &str) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create journal directory")?;
        }
        fs::write(&self.path, format!("{line}\n")).context("Failed to write journal file")
    }

    /// The failure recorded by the previous boot, if any.
    pub fn read(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let line = contents.lines().next().unwrap_or("").to_owned();
                if line.is_empty() {
                    None
                } else {
                    Some(line)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read failure journal: {e}");
                None
            }
        }
    }

    /// Delete the journal on clean system-ready.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Cleared failure journal"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear failure journal: {e}"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn journal() -> (FailureJournal, TempDir) {
        let dir = TempDir::new().unwrap();
        (FailureJournal::new(dir.path().join("failure")), dir)
    }

    #[test]
    fn test_record_and_read_single_line() {
        let (journal, _dir) = journal();
        assert_eq!(journal.read(), None);

        journal.record(100, "apex activation failed");
        assert_eq!(
            journal.read().as_deref(),
            Some("Failed to install session 100: apex activation failed")
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let (journal, _dir) = journal();
        journal.record(100, "first");
        journal.record(101, "second");
        assert_eq!(
            journal.read().as_deref(),
            Some("Failed to install session 100: first")
        );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (journal, _dir) = journal();
        journal.record(100, "reason");
        journal.clear();
        assert_eq!(journal.read(), None);
        // Clearing an absent journal is not an error.
        journal.clear();
    }
}
