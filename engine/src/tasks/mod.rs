//! Task persistence
//!
//! Units of orchestrated work for one project, stored in `tasks.json`.
//! Pipeline tasks carry the serialized pipeline request (the task id doubles
//! as the run id); critique-analysis tasks carry a critique waiting to be
//! turned into canon rules.
//!
//! Status only moves forward: PENDING → RUNNING → DONE | FAILED (PENDING may
//! also fail directly). A failed task is retried by creating a new task with
//! the same payload that points back at it.
//!
//! Every change is written to disk before it becomes visible; a failed write
//! leaves the in-memory list as it was.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sdk::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::persist;

/// Task status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` keeps status monotonic.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Task kind enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Pipeline,
    CritiqueAnalysis,
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Pipeline => "pipeline",
            TaskKind::CritiqueAnalysis => "critique_analysis",
        }
    }
}

/// Task record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub project: String,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_of: Option<String>,
}

/// Task repository backed by a JSON file
pub struct TaskStore {
    path: PathBuf,
    project: String,
    tasks: Mutex<Vec<Task>>,
}

impl TaskStore {
    pub fn open(path: impl Into<PathBuf>, project: impl Into<String>) -> EngineResult<Self> {
        let path = path.into();
        let tasks = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            project: project.into(),
            tasks: Mutex::new(tasks),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, tasks: &[Task]) -> EngineResult<()> {
        persist::write_json_atomic(&self.path, tasks)
    }

    /// Create a new PENDING task
    pub fn create(&self, kind: TaskKind, payload: serde_json::Value) -> EngineResult<Task> {
        self.insert(kind, payload, None)
    }

    fn insert(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
        retry_of: Option<String>,
    ) -> EngineResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            project: self.project.clone(),
            kind,
            payload,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            error: None,
            retry_of,
        };
        let mut tasks = self.lock();
        let mut next = tasks.clone();
        next.push(task.clone());
        self.save(&next)?;
        *tasks = next;
        debug!(project = %self.project, task_id = %task.id, kind = kind.as_str(), "Task created");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        self.lock().clone()
    }

    /// PENDING or RUNNING tasks of `kind`, oldest first.
    pub fn active(&self, kind: TaskKind) -> Vec<Task> {
        self.lock()
            .iter()
            .filter(|t| t.kind == kind && t.status.is_active())
            .cloned()
            .collect()
    }

    fn transition(&self, id: &str, next: TaskStatus, error: Option<String>) -> EngineResult<Task> {
        let mut tasks = self.lock();
        let mut snapshot = tasks.clone();
        let task = snapshot
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        if !task.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "task {} cannot go from {} to {}",
                id,
                task.status.as_str(),
                next.as_str()
            )));
        }

        task.status = next;
        task.updated_at = Utc::now();
        if error.is_some() {
            task.error = error;
        }
        let updated = task.clone();
        self.save(&snapshot)?;
        *tasks = snapshot;
        Ok(updated)
    }

    pub fn mark_running(&self, id: &str) -> EngineResult<Task> {
        self.transition(id, TaskStatus::Running, None)
    }

    pub fn mark_done(&self, id: &str) -> EngineResult<Task> {
        self.transition(id, TaskStatus::Done, None)
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> EngineResult<Task> {
        self.transition(id, TaskStatus::Failed, Some(error.into()))
    }

    /// New PENDING task with the payload of a FAILED one.
    pub fn retry(&self, id: &str) -> EngineResult<Task> {
        let original = self
            .get(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        if original.status != TaskStatus::Failed {
            return Err(EngineError::InvalidTransition(format!(
                "only FAILED tasks can be retried; {} is {}",
                id,
                original.status.as_str()
            )));
        }
        self.insert(original.kind, original.payload, Some(original.id))
    }
}
