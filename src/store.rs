//! In-memory registry of staged sessions. The store owns every session;
//! other components work on snapshots and write back through the store's
//! lock. Persistence is delegated to the session recorder, which is only
//! notified of dirty sessions and never called under the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use airlock_api::{
    error::{AirlockError, CommitError},
    session::{FailureCode, SessionState, SessionTree, StagedSession},
    SessionId,
};

use crate::platform::SessionRecorder;
use crate::progress::Observers;

pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, StagedSession>>,
    recorder: Arc<dyn SessionRecorder>,
    observers: Arc<Observers>,
}

impl SessionStore {
    pub fn new(recorder: Arc<dyn SessionRecorder>, observers: Arc<Observers>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            recorder,
            observers,
        }
    }

    /// Insert a freshly created session, wiring it into its parent's child
    /// list. Child lists form a tree of depth one, so the parent itself must
    /// not be a child.
    pub fn create(&self, session: StagedSession) -> Result<(), AirlockError> {
        let dirty = {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&session.id) {
                return Err(AirlockError::new(CommitError::DuplicateSessionId {
                    id: session.id,
                }));
            }

            let mut dirty = Vec::with_capacity(2);
            if let Some(parent_id) = session.parent() {
                let parent = sessions.get_mut(&parent_id).ok_or_else(|| {
                    AirlockError::new(CommitError::ParentNotFound {
                        id: session.id,
                        parent: parent_id,
                    })
                })?;
                if parent.parent().is_some() {
                    return Err(AirlockError::new(CommitError::GrandchildSession {
                        parent: parent_id,
                    }));
                }
                if !parent.children.contains(&session.id) {
                    parent.children.push(session.id);
                }
                dirty.push(parent.clone());
            }
            sessions.insert(session.id, session.clone());
            dirty.push(session);
            dirty
        };

        for session in &dirty {
            self.recorder.note_dirty(session);
        }
        Ok(())
    }

    /// Snapshot of one session.
    pub fn get(&self, id: SessionId) -> Option<StagedSession> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Consistent snapshot of a root session together with its children.
    pub fn tree(&self, id: SessionId) -> Option<SessionTree> {
        let sessions = self.sessions.lock().unwrap();
        let root = sessions.get(&id)?.clone();
        let children = root
            .children
            .iter()
            .filter_map(|child| sessions.get(child).cloned())
            .collect();
        Some(SessionTree { root, children })
    }

    /// Id of the root of the tree containing `id`.
    pub fn root_of(&self, id: SessionId) -> Option<SessionId> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&id)?;
        Some(session.parent().unwrap_or(session.id))
    }

    /// Remove a session from the in-memory map. The caller has already moved
    /// the session to a terminal or destroyed state.
    pub fn abort(&self, id: SessionId) {
        let removed = self.sessions.lock().unwrap().remove(&id);
        if removed.is_some() {
            self.recorder.remove(id);
        }
    }

    /// Snapshot of every live committed session: committed, not destroyed,
    /// and not yet terminal.
    pub fn list_committed(&self) -> Vec<StagedSession> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                !s.destroyed
                    && !s.state.is_terminal()
                    && !matches!(s.state, SessionState::Created)
            })
            .cloned()
            .collect()
    }

    /// Snapshot of every root session, for boot reconciliation.
    pub fn roots(&self) -> Vec<StagedSession> {
        let mut roots: Vec<_> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.parent().is_none())
            .cloned()
            .collect();
        roots.sort_by_key(|s| s.id);
        roots
    }

    /// Reload a session from persistence. A device upgrade invalidates every
    /// session that had not reached a terminal state before the upgrade.
    pub fn restore(&self, mut session: StagedSession, device_upgrading: bool) {
        if device_upgrading && !session.state.is_terminal() {
            warn!(
                "Session {} invalidated by device upgrade",
                session.id
            );
            session.set_failed(FailureCode::ActivationFailed, "build fingerprint changed");
        }
        let id = session.id;
        let state = session.state;
        self.sessions.lock().unwrap().insert(id, session.clone());
        self.recorder.note_dirty(&session);
        self.observers.session_state_changed(id, state);
    }

    /// Apply a mutation to one session under the store lock. The recorder
    /// and observers are notified outside the lock. Sessions in a terminal
    /// state are never mutated.
    pub fn update<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut StagedSession) -> T,
    ) -> Result<T, AirlockError> {
        let (result, snapshot, state_changed) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&id)
                .ok_or_else(|| AirlockError::new(CommitError::SessionNotFound { id }))?;
            if session.state.is_terminal() {
                debug!(
                    "Ignoring mutation of session {id} in terminal state '{:?}'",
                    session.state
                );
                return Err(AirlockError::new(CommitError::NotCommittable {
                    id,
                    state: session.state.into(),
                }));
            }
            let before = session.state;
            let result = f(session);
            (result, session.clone(), session.state != before)
        };

        self.recorder.note_dirty(&snapshot);
        if state_changed {
            self.observers
                .session_state_changed(snapshot.id, snapshot.state);
        }
        Ok(result)
    }

    /// Move a session to `Failed` with the given code and message. A no-op
    /// for sessions already terminal.
    pub fn fail_session(&self, id: SessionId, code: FailureCode, message: impl Into<String>) {
        let message = message.into();
        warn!("Failing session {id}: {message}");
        if let Err(e) = self.update(id, |s| s.set_failed(code, message.clone())) {
            debug!("Could not fail session {id}: {e:?}");
        }
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) -> Result<(), AirlockError> {
        self.update(id, |s| s.state = state)
    }

    pub fn mark_destroyed(&self, id: SessionId) -> Result<(), AirlockError> {
        self.update(id, |s| s.destroyed = true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use airlock_api::session::{InstallFlag, SessionParams};

    use crate::platform::testutil::MockRecorder;

    use super::*;

    fn store() -> (SessionStore, Arc<MockRecorder>) {
        let recorder = Arc::new(MockRecorder::default());
        let store = SessionStore::new(recorder.clone(), Arc::new(Observers::default()));
        (store, recorder)
    }

    fn session(id: SessionId, parent: Option<SessionId>) -> StagedSession {
        StagedSession::new(
            id,
            SessionParams {
                parent,
                flags: InstallFlag::Staged.into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_create_rejects_duplicate_ids() {
        let (store, _) = store();
        store.create(session(1, None)).unwrap();
        let err = store.create(session(1, None)).unwrap_err();
        assert!(matches!(
            err.kind(),
            airlock_api::error::ErrorKind::Commit(CommitError::DuplicateSessionId { id: 1 })
        ));
    }

    #[test]
    fn test_create_wires_children_into_parent() {
        let (store, recorder) = store();
        store.create(session(1, None)).unwrap();
        store.create(session(2, Some(1))).unwrap();
        store.create(session(3, Some(1))).unwrap();

        assert_eq!(store.get(1).unwrap().children, vec![2, 3]);
        assert_eq!(store.root_of(3), Some(1));
        // Both parent and child records were handed to the recorder.
        assert_eq!(recorder.records.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_create_rejects_grandchildren() {
        let (store, _) = store();
        store.create(session(1, None)).unwrap();
        store.create(session(2, Some(1))).unwrap();
        let err = store.create(session(3, Some(2))).unwrap_err();
        assert!(matches!(
            err.kind(),
            airlock_api::error::ErrorKind::Commit(CommitError::GrandchildSession { parent: 2 })
        ));
    }

    #[test]
    fn test_create_rejects_orphans() {
        let (store, _) = store();
        let err = store.create(session(2, Some(1))).unwrap_err();
        assert!(matches!(
            err.kind(),
            airlock_api::error::ErrorKind::Commit(CommitError::ParentNotFound { id: 2, parent: 1 })
        ));
    }

    #[test]
    fn test_list_committed_filters_states() {
        let (store, _) = store();
        for id in 1..=5 {
            store.create(session(id, None)).unwrap();
        }
        store.set_state(2, SessionState::Verifying).unwrap();
        store.set_state(3, SessionState::Ready).unwrap();
        store.set_state(4, SessionState::Ready).unwrap();
        store.mark_destroyed(4).unwrap();
        store
            .update(5, |s| s.set_failed(FailureCode::Unknown, "boom"))
            .unwrap();

        let mut committed: Vec<_> = store.list_committed().iter().map(|s| s.id).collect();
        committed.sort_unstable();
        assert_eq!(committed, vec![2, 3]);
    }

    #[test]
    fn test_restore_fails_non_terminal_sessions_on_upgrade() {
        let (store, _) = store();
        let mut ready = session(1, None);
        ready.state = SessionState::Ready;
        store.restore(ready, true);

        let restored = store.get(1).unwrap();
        assert_eq!(restored.state, SessionState::Failed);
        let failure = restored.failure.unwrap();
        assert_eq!(failure.code, FailureCode::ActivationFailed);
        assert_eq!(failure.message, "build fingerprint changed");

        let mut applied = session(2, None);
        applied.state = SessionState::Applied;
        store.restore(applied, true);
        assert_eq!(store.get(2).unwrap().state, SessionState::Applied);
    }

    #[test]
    fn test_terminal_sessions_are_never_mutated() {
        let (store, _) = store();
        store.create(session(1, None)).unwrap();
        store
            .update(1, |s| s.set_failed(FailureCode::Conflict, "blocked"))
            .unwrap();

        assert!(store.set_state(1, SessionState::Ready).is_err());
        store.fail_session(1, FailureCode::Unknown, "second failure");
        let session = store.get(1).unwrap();
        assert_eq!(session.failure_code(), Some(FailureCode::Conflict));
    }

    #[test]
    fn test_abort_removes_from_store_and_recorder() {
        let (store, recorder) = store();
        store.create(session(1, None)).unwrap();
        store.abort(1);
        assert!(store.get(1).is_none());
        assert_eq!(*recorder.removed.lock().unwrap(), vec![1]);
    }
}
