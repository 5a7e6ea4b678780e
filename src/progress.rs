//! Thin visibility adapters. Collaborators that want to surface install
//! progress (status bars, launcher badges, telemetry) register an observer;
//! the core publishes transitions after releasing its own locks.

use std::sync::{Arc, Mutex};

use airlock_api::{session::SessionState, SessionId};

pub trait InstallObserver: Send + Sync {
    fn session_state_changed(&self, id: SessionId, state: SessionState);

    fn session_progress(&self, _id: SessionId, _progress: f32) {}
}

#[derive(Default)]
pub struct Observers {
    observers: Mutex<Vec<Arc<dyn InstallObserver>>>,
}

impl Observers {
    pub fn register(&self, observer: Arc<dyn InstallObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn session_state_changed(&self, id: SessionId, state: SessionState) {
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.session_state_changed(id, state);
        }
    }

    pub fn session_progress(&self, id: SessionId, progress: f32) {
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.session_progress(id, progress);
        }
    }
}
