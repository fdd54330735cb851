use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quill_core::types::RunId;

/// Active runs and their cancellation handles.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is recovered; every entry is a whole insert or remove.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runs.lock().unwrap_or_else(|poisoned| {
            warn!("Run registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Track a run and hand back the token its executor should watch.
    pub fn register(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(run_id.to_string(), token.clone());
        token
    }

    /// Request cancellation. Returns false if the run is not active.
    pub fn cancel(&self, run_id: &str) -> bool {
        let token = self.lock().get(run_id).cloned();
        match token {
            Some(token) => {
                info!(run_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let runs = self.lock();
        for token in runs.values() {
            token.cancel();
        }
        if !runs.is_empty() {
            info!(count = runs.len(), "Cancelling all active runs");
        }
        runs.len()
    }

    pub fn remove(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn active(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_fires_registered_token() {
        let registry = RunRegistry::new();
        let a = RunId::from_string("run-a");
        let b = RunId::from_string("run-b");
        let token_a = registry.register(&a);
        let token_b = registry.register(&b);

        assert!(registry.cancel("run-a"));
        assert!(token_a.is_cancelled());
        assert!(!token_b.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_run() {
        assert!(!RunRegistry::new().cancel("ghost"));
    }

    #[test]
    fn test_remove_and_cancel_all() {
        let registry = RunRegistry::new();
        let t1 = registry.register(&RunId::from_string("r1"));
        let t2 = registry.register(&RunId::from_string("r2"));
        registry.remove("r1");

        assert!(!registry.is_active("r1"));
        assert_eq!(registry.active(), vec!["r2".to_string()]);
        assert_eq!(registry.cancel_all(), 1);
        assert!(!t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn test_poisoned_lock_still_tracks_runs() {
        let registry = std::sync::Arc::new(RunRegistry::new());
        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.runs.lock().unwrap();
            panic!("poison the registry");
        })
        .join();
        assert!(registry.runs.is_poisoned());

        let token = registry.register(&RunId::from_string("run-after-panic"));
        assert!(registry.is_active("run-after-panic"));
        assert!(registry.cancel("run-after-panic"));
        assert!(token.is_cancelled());
    }
}
