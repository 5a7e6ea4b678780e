//! Sqlite-backed persistence for session records and the session-id
//! counter. Implements the store's recorder interface: the session store
//! decides *when* a record is dirty, this module decides *how* it is kept.

use anyhow::{Context, Error};
use log::{info, warn};
use std::{fs, path::Path, sync::Mutex};

use airlock_api::{session::StagedSession, SessionId};

use crate::platform::SessionRecorder;

const NEXT_SESSION_ID_KEY: &str = "next_session_id";

pub struct Datastore {
    db: Mutex<sqlite::Connection>,
}

impl Datastore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        info!("Loading session datastore from {}", path.display());
        Ok(Self {
            db: Mutex::new(Self::make_datastore(path)?),
        })
    }

    fn make_datastore(path: &Path) -> Result<sqlite::Connection, Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create datastore directory")?;
        }

        let db = sqlite::open(path)?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY,
                contents TEXT NOT NULL
            )",
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        )?;
        Ok(db)
    }

    fn write_session(&self, session: &StagedSession) -> Result<(), Error> {
        let contents =
            serde_yaml::to_string(session).context("Failed to serialize session record")?;
        let db = self.db.lock().unwrap();
        let mut statement = db
            .prepare("INSERT OR REPLACE INTO sessions (id, contents) VALUES (?, ?)")
            .context("Failed to save session (prepare)")?;
        statement
            .bind((1, session.id as i64))
            .context("Failed to save session (bind id)")?;
        statement
            .bind((2, &*contents))
            .context("Failed to save session (bind contents)")?;
        statement.next().context("Failed to save session")?;
        Ok(())
    }

    fn delete_session(&self, id: SessionId) -> Result<(), Error> {
        let db = self.db.lock().unwrap();
        let mut statement = db
            .prepare("DELETE FROM sessions WHERE id = ?")
            .context("Failed to delete session (prepare)")?;
        statement
            .bind((1, id as i64))
            .context("Failed to delete session (bind)")?;
        statement.next().context("Failed to delete session")?;
        Ok(())
    }
}

impl SessionRecorder for Datastore {
    fn note_dirty(&self, session: &StagedSession) {
        if let Err(e) = self.write_session(session) {
            warn!("Failed to persist session {}: {e:?}", session.id);
        }
    }

    fn remove(&self, id: SessionId) {
        if let Err(e) = self.delete_session(id) {
            warn!("Failed to remove session {id} from datastore: {e:?}");
        }
    }

    fn load_all(&self) -> Result<Vec<StagedSession>, Error> {
        let db = self.db.lock().unwrap();
        let result = db
            .prepare("SELECT contents FROM sessions ORDER BY id ASC")
            .context("Failed to load sessions (prepare)")?
            .into_iter()
            .map(|row| {
                let row = row.context("Failed to read session row")?;
                serde_yaml::from_str(row.read::<&str, _>(0))
                    .context("Failed to parse saved session record")
            })
            .collect();
        result
    }

    fn allocate_session_id(&self) -> Result<SessionId, Error> {
        let db = self.db.lock().unwrap();

        let next: i64 = db
            .prepare("SELECT value FROM meta WHERE key = ?")
            .context("Failed to read session-id counter (prepare)")?
            .into_iter()
            .bind((1, NEXT_SESSION_ID_KEY))
            .context("Failed to read session-id counter (bind)")?
            .next()
            .transpose()
            .context("Failed to read session-id counter")?
            .map(|row| row.read::<i64, _>(0))
            .unwrap_or(1);

        let mut statement = db
            .prepare("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .context("Failed to advance session-id counter (prepare)")?;
        statement
            .bind((1, NEXT_SESSION_ID_KEY))
            .context("Failed to advance session-id counter (bind key)")?;
        statement
            .bind((2, next + 1))
            .context("Failed to advance session-id counter (bind value)")?;
        statement
            .next()
            .context("Failed to advance session-id counter")?;

        Ok(next as SessionId)
    }
}

#[cfg(test)]
mod tests {
    use airlock_api::session::{FailureCode, SessionParams, SessionState};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_sessions_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.sqlite");

        {
            let datastore = Datastore::open(&path).unwrap();
            let mut session = StagedSession::new(100, SessionParams::default());
            session.state = SessionState::Ready;
            datastore.note_dirty(&session);

            session.set_failed(FailureCode::ActivationFailed, "daemon lost the session");
            datastore.note_dirty(&session);
        }

        let datastore = Datastore::open(&path).unwrap();
        let sessions = datastore.load_all().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, 100);
        assert_eq!(sessions[0].state, SessionState::Failed);
        assert_eq!(
            sessions[0].failure.as_ref().unwrap().message,
            "daemon lost the session"
        );
    }

    #[test]
    fn test_remove_deletes_the_record() {
        let temp_dir = TempDir::new().unwrap();
        let datastore = Datastore::open(&temp_dir.path().join("sessions.sqlite")).unwrap();

        datastore.note_dirty(&StagedSession::new(1, SessionParams::default()));
        datastore.note_dirty(&StagedSession::new(2, SessionParams::default()));
        datastore.remove(1);

        let ids: Vec<_> = datastore.load_all().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_session_ids_are_never_reused() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.sqlite");

        let first = {
            let datastore = Datastore::open(&path).unwrap();
            let a = datastore.allocate_session_id().unwrap();
            let b = datastore.allocate_session_id().unwrap();
            assert_eq!(b, a + 1);
            b
        };

        // The counter survives a process restart even though no session
        // record references the allocated ids.
        let datastore = Datastore::open(&path).unwrap();
        assert_eq!(datastore.allocate_session_id().unwrap(), first + 1);
    }
}
