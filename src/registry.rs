//! Single-flight registry of active work, keyed by workspace path.
//!
//! One control-loop run or one-shot per workspace at a time. The
//! registry owns its map; callers interact only through these methods.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::error::DroverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ControlRun,
    OneShot,
}

struct TaskRecord {
    run_id: Uuid,
    kind: TaskKind,
    cancel: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    started_at: DateTime<Utc>,
}

/// Handle returned to the worker that registered. Carries the shared
/// cancel flag and the slot where a spawned child process may be
/// published for cancellation.
#[derive(Debug)]
pub struct ActiveTask {
    pub run_id: Uuid,
    pub cancel: Arc<AtomicBool>,
    pub child_slot: Arc<Mutex<Option<Child>>>,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the workspace for a new unit of work. Fails while another
    /// unit is still registered for the same key.
    pub fn register(&self, key: &str, kind: TaskKind) -> Result<ActiveTask, DroverError> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(key) {
            return Err(DroverError::AlreadyRunning {
                key: key.to_string(),
            });
        }
        let record = TaskRecord {
            run_id: Uuid::new_v4(),
            kind,
            cancel: Arc::new(AtomicBool::new(false)),
            child: Arc::new(Mutex::new(None)),
            started_at: Utc::now(),
        };
        let handle = ActiveTask {
            run_id: record.run_id,
            cancel: Arc::clone(&record.cancel),
            child_slot: Arc::clone(&record.child),
        };
        tasks.insert(key.to_string(), record);
        Ok(handle)
    }

    /// Cancel whatever is active for the key. Returns `false` when
    /// nothing was active. The record is removed under the lock; the
    /// flag store and child kill happen outside it.
    pub fn cancel(&self, key: &str) -> bool {
        let record = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.remove(key)
        };
        let Some(record) = record else {
            return false;
        };

        let elapsed = Utc::now().signed_duration_since(record.started_at);
        info!(
            key,
            run_id = %record.run_id,
            kind = ?record.kind,
            elapsed_secs = elapsed.num_seconds(),
            "cancelling active task"
        );
        record.cancel.store(true, Ordering::SeqCst);
        if let Some(child) = record.child.lock().unwrap().as_mut() {
            let _ = child.kill();
        }
        true
    }

    /// Release the key when the worker finishes. The run id must match
    /// so a stale worker never clobbers a newer registration.
    pub fn complete(&self, key: &str, run_id: Uuid) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.get(key).is_some_and(|record| record.run_id == run_id) {
            tasks.remove(key);
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(key)
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tasks.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn register_is_single_flight_per_key() {
        let registry = TaskRegistry::new();
        let task = registry.register("/ws/a", TaskKind::ControlRun).unwrap();

        let err = registry.register("/ws/a", TaskKind::OneShot).unwrap_err();
        assert!(matches!(err, DroverError::AlreadyRunning { .. }));

        // other keys are unaffected
        registry.register("/ws/b", TaskKind::OneShot).unwrap();

        registry.complete("/ws/a", task.run_id);
        assert!(!registry.is_active("/ws/a"));
        assert!(registry.is_active("/ws/b"));
    }

    #[test]
    fn cancel_on_idle_key_is_a_noop() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel("/ws/nothing"));
    }

    #[test]
    fn cancel_sets_flag_and_frees_the_key_immediately() {
        let registry = TaskRegistry::new();
        let task = registry.register("/ws/a", TaskKind::ControlRun).unwrap();

        assert!(registry.cancel("/ws/a"));
        assert!(task.cancel.load(Ordering::SeqCst));
        assert!(!registry.is_active("/ws/a"));

        // a fresh registration can claim the key right away
        registry.register("/ws/a", TaskKind::ControlRun).unwrap();
    }

    #[test]
    fn complete_ignores_mismatched_run_id() {
        let registry = TaskRegistry::new();
        let task = registry.register("/ws/a", TaskKind::OneShot).unwrap();

        registry.complete("/ws/a", Uuid::new_v4());
        assert!(registry.is_active("/ws/a"));

        registry.complete("/ws/a", task.run_id);
        assert!(!registry.is_active("/ws/a"));
    }

    #[test]
    fn active_keys_are_sorted() {
        let registry = TaskRegistry::new();
        registry.register("/ws/b", TaskKind::OneShot).unwrap();
        registry.register("/ws/a", TaskKind::ControlRun).unwrap();

        assert_eq!(registry.active_keys(), vec!["/ws/a", "/ws/b"]);
    }

    #[test]
    fn concurrent_registration_admits_exactly_one() {
        let registry = std::sync::Arc::new(TaskRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = std::sync::Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                registry.register("/ws/contested", TaskKind::ControlRun).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_a_published_child() {
        use std::process::Command;
        use std::time::{Duration, Instant};

        let registry = TaskRegistry::new();
        let task = registry.register("/ws/a", TaskKind::OneShot).unwrap();

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        *task.child_slot.lock().unwrap() = Some(child);

        let started = Instant::now();
        assert!(registry.cancel("/ws/a"));

        let mut child = task.child_slot.lock().unwrap().take().unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
