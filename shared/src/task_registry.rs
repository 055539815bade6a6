/// Per-requester registry of in-flight work.
///
/// At most one task per requester key. Each admitted task gets a
/// `CancellationToken`; the returned `TaskHandle` retires the entry when dropped,
/// so success, failure, cancellation and panics all release the key.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::TaskError;
use crate::models::TaskKind;

struct ActiveTask {
    task_id: String,
    kind: TaskKind,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    percent: f64,
}

/// Read-only view of an active task, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTaskInfo {
    pub key: String,
    pub task_id: String,
    pub kind: TaskKind,
    pub started_at: DateTime<Utc>,
    pub percent: f64,
}

/// Process-wide task state, injected into every component that admits or cancels work.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, ActiveTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveTask>> {
        // Entries stay consistent even if a holder panicked; no invariant spans the lock.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a new task for `key`. Fails if the requester already has one.
    pub fn admit(&self, key: &str, kind: TaskKind) -> Result<TaskHandle, TaskError> {
        let mut tasks = self.lock();
        if let Some(existing) = tasks.get(key) {
            warn!("Requester {} already has active {} task {}", key, existing.kind, existing.task_id);
            return Err(TaskError::AlreadyActive {
                key: key.to_string(),
                kind: existing.kind,
            });
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        tasks.insert(
            key.to_string(),
            ActiveTask {
                task_id: task_id.clone(),
                kind,
                cancel: cancel.clone(),
                started_at: Utc::now(),
                percent: 0.0,
            },
        );

        info!("Task {} admitted for {} (kind: {})", task_id, key, kind);
        Ok(TaskHandle {
            key: key.to_string(),
            task_id,
            cancel,
            registry: self.clone(),
        })
    }

    /// Signal the requester's task and remove its entry. Returns false if none was active.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(task) => {
                task.cancel.cancel();
                info!("Task {} for {} cancelled", task.task_id, key);
                true
            }
            None => false,
        }
    }

    /// Cancel every active task. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, ActiveTask)> = self.lock().drain().collect();
        for (key, task) in &drained {
            task.cancel.cancel();
            debug!("Task {} for {} cancelled", task.task_id, key);
        }
        if !drained.is_empty() {
            info!("Cancelled {} active task(s)", drained.len());
        }
        drained.len()
    }

    /// Remove the requester's entry. Removing an absent key is a no-op.
    pub fn retire(&self, key: &str) {
        if let Some(task) = self.lock().remove(key) {
            info!("Task {} for {} retired", task.task_id, key);
        }
    }

    /// Remove the entry only if it still belongs to `task_id`.
    ///
    /// A cancel followed by a fresh `admit` can put a newer task under the same
    /// key before the old task finishes unwinding.
    fn retire_task(&self, key: &str, task_id: &str) {
        let mut tasks = self.lock();
        if tasks.get(key).is_some_and(|t| t.task_id == task_id) {
            tasks.remove(key);
            info!("Task {} for {} retired", task_id, key);
        }
    }

    fn update<F: FnOnce(&mut ActiveTask)>(&self, key: &str, task_id: &str, f: F) {
        if let Some(task) = self.lock().get_mut(key) {
            if task.task_id == task_id {
                f(task);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<ActiveTaskInfo> {
        self.lock().get(key).map(|t| info_for(key, t))
    }

    pub fn list(&self) -> Vec<ActiveTaskInfo> {
        let mut all: Vec<ActiveTaskInfo> = self.lock().iter().map(|(k, t)| info_for(k, t)).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }
}

fn info_for(key: &str, task: &ActiveTask) -> ActiveTaskInfo {
    ActiveTaskInfo {
        key: key.to_string(),
        task_id: task.task_id.clone(),
        kind: task.kind,
        started_at: task.started_at,
        percent: task.percent,
    }
}

/// Admission ticket for one task. Retires the registry entry on drop.
pub struct TaskHandle {
    key: String,
    task_id: String,
    cancel: CancellationToken,
    registry: TaskRegistry,
}

impl TaskHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move the task to a new phase, e.g. download finished and transcode starts.
    pub fn set_kind(&self, kind: TaskKind) {
        self.registry.update(&self.key, &self.task_id, |t| {
            t.kind = kind;
            t.percent = 0.0;
        });
    }

    pub fn update_progress(&self, percent: f64) {
        self.registry.update(&self.key, &self.task_id, |t| t.percent = percent);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.registry.retire_task(&self.key, &self.task_id);
    }
}
