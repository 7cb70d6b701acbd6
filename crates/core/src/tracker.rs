use crate::types::RunId;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Process-local set of currently-executing run IDs. The history reconciler
/// consults it to tell a live `running` run from an orphaned one.
#[derive(Default)]
pub struct ActiveRuns {
    runs: RwLock<HashSet<String>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run_id: &RunId) {
        self.runs.write().unwrap().insert(run_id.to_string());
    }

    pub fn remove(&self, run_id: &RunId) {
        self.runs.write().unwrap().remove(run_id.as_str());
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.runs.read().unwrap().contains(run_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().unwrap().is_empty()
    }

    /// Track a run for the guard's lifetime.
    pub fn track(self: &Arc<Self>, run_id: RunId) -> ActiveRunGuard {
        self.insert(&run_id);
        ActiveRunGuard {
            tracker: self.clone(),
            run_id,
        }
    }
}

/// Removes the run from the active set when dropped, so completion and every
/// error path unwind the tracking entry.
pub struct ActiveRunGuard {
    tracker: Arc<ActiveRuns>,
    run_id: RunId,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_release() {
        let tracker = Arc::new(ActiveRuns::new());
        let run_id = RunId::from("run-1".to_string());

        {
            let _guard = tracker.track(run_id.clone());
            assert!(tracker.contains(&run_id));
            assert_eq!(tracker.len(), 1);
        }

        assert!(!tracker.contains(&run_id));
        assert!(tracker.is_empty());
    }
}
