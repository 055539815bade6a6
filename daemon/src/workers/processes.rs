/// Bounded registry of running child processes.
///
/// Each supervisor registers its job before launching a child and keeps the
/// returned `ProcessSlot` alive for the child's lifetime. The registry never
/// touches a child directly: `terminate_all` cancels each job's token and the
/// owning supervisor kills and reaps its own process.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ProcessEntry {
    label: &'static str,
    pid: Option<u32>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Snapshot of a registered process, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub job_id: String,
    pub label: &'static str,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProcessRegistry {
    capacity: usize,
    entries: Arc<Mutex<HashMap<String, ProcessEntry>>>,
}

impl ProcessRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a job. Returns None when the registry is full.
    pub fn register(
        &self,
        job_id: &str,
        label: &'static str,
        cancel: CancellationToken,
    ) -> Option<ProcessSlot> {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            return None;
        }
        entries.insert(
            job_id.to_string(),
            ProcessEntry {
                label,
                pid: None,
                cancel,
                started_at: Utc::now(),
            },
        );
        debug!("Registered {} process for job {}", label, job_id);
        Some(ProcessSlot {
            job_id: job_id.to_string(),
            registry: self.clone(),
        })
    }

    /// Signal every registered job to terminate its child. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let entries = self.lock();
        for (job_id, entry) in entries.iter() {
            entry.cancel.cancel();
            debug!("Terminating {} process for job {} (pid {:?})", entry.label, job_id, entry.pid);
        }
        if !entries.is_empty() {
            info!("Signalled {} running process(es) to terminate", entries.len());
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.lock()
            .iter()
            .map(|(job_id, e)| ProcessInfo {
                job_id: job_id.clone(),
                label: e.label,
                pid: e.pid,
                started_at: e.started_at,
            })
            .collect()
    }
}

/// Registration held by a supervisor; deregisters on drop.
pub struct ProcessSlot {
    job_id: String,
    registry: ProcessRegistry,
}

impl ProcessSlot {
    pub fn set_pid(&self, pid: Option<u32>) {
        if let Some(entry) = self.registry.lock().get_mut(&self.job_id) {
            entry.pid = pid;
        }
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.job_id);
        debug!("Deregistered process for job {}", self.job_id);
    }
}
