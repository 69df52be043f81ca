use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::progress::ProgressUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Starting,
    Downloading,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub status: TaskStatus,
    pub percentage: f64,
    pub message: String,
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    fn new() -> Self {
        Self {
            status: TaskStatus::Starting,
            percentage: 0.0,
            message: "Initializing download...".to_string(),
            filename: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Percentages never move backwards: a second stream restarting at 0%
    /// leaves the reported value where it was.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        match update {
            ProgressUpdate::Downloading { percentage } => {
                self.status = TaskStatus::Downloading;
                self.percentage = self.percentage.max(percentage.clamp(0.0, 100.0));
                self.message = format!("{percentage:.1}% completed");
            }
            ProgressUpdate::Merging => {
                self.message = "Merging formats...".to_string();
            }
            ProgressUpdate::PostProcessing => {
                self.message = "Post-processing...".to_string();
            }
        }
    }

    pub fn complete(&mut self, filename: String) {
        self.status = TaskStatus::Completed;
        self.percentage = 100.0;
        self.message = "Download Finished!".to_string();
        self.filename = Some(filename);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.message = message.into();
        self.finished_at = Some(Utc::now());
    }

    fn view(&self) -> TaskView {
        TaskView {
            status: self.status,
            percentage: self.percentage,
            message: self.message.clone(),
            filename: self.filename.clone(),
        }
    }
}

/// Point-in-time copy of a task, safe to hand to status pollers.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub status: TaskStatus,
    pub percentage: f64,
    pub message: String,
    pub filename: Option<String>,
}

/// In-memory task table for status polling. Lives as long as the process.
///
/// One coarse lock guards the map; every critical section is a copy or a
/// single field update, so pollers wait at most for one mutation.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: Uuid) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Task::new());
    }

    pub fn get(&self, id: &Uuid) -> Option<TaskView> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(Task::view)
    }

    /// Applies `mutate` to a running task. Returns false when the id is
    /// unknown or the task already reached a terminal state.
    pub fn update(&self, id: &Uuid, mutate: impl FnOnce(&mut Task)) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        match tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                mutate(task);
                true
            }
            _ => false,
        }
    }

    /// Drops finished tasks whose terminal transition is older than `retention`.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        tasks.retain(|_, task| task.finished_at.is_none_or(|finished| finished > cutoff));
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
