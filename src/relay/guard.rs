//! At most one agent invocation per session.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which sessions have a build in flight.
#[derive(Debug, Clone, Default)]
pub struct BuildGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl BuildGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `session_id` busy. `None` if a build is already running for it.
    pub fn try_acquire(&self, session_id: &str) -> Option<BuildPermit> {
        if !self.in_flight.lock().insert(session_id.to_string()) {
            return None;
        }
        Some(BuildPermit {
            in_flight: self.in_flight.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.in_flight.lock().contains(session_id)
    }
}

/// Held for the duration of a build; dropping it frees the session.
#[derive(Debug)]
pub struct BuildPermit {
    in_flight: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for BuildPermit {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.session_id);
    }
}
