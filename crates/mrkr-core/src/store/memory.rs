//! In-memory [`Store`] implementation for testing.
//!
//! All state lives behind one `std::sync::RwLock`, so every operation is
//! atomic with respect to every other one.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ConsistencyError;
use crate::models::{NewProject, OcrResult, Project, SourceFile, Task};
use crate::reconcile::{plan, ReconcileSummary};
use crate::status::{ProjectStatus, TaskStatus};

use super::Store;

#[derive(Default)]
struct State {
    projects: HashMap<String, Project>,
    tasks: HashMap<String, Task>,
    ocr_results: HashMap<String, OcrResult>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_project(&self, project: NewProject, now: DateTime<Utc>) -> Result<Project> {
        let project = project.into_project(now);
        let mut state = self.state.write().expect("lock poisoned");
        state.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.projects.get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let state = self.state.read().expect("lock poisoned");
        let mut projects: Vec<Project> = state.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        last_scan: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let project = state
            .projects
            .get_mut(id)
            .ok_or_else(|| ConsistencyError::ProjectNotFound(id.to_string()))?;
        project.status = status;
        if last_scan.is_some() {
            project.last_scan = last_scan;
        }
        Ok(())
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let state = self.state.read().expect("lock poisoned");
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.uri.cmp(&b.uri).then_with(|| a.created.cmp(&b.created)));
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.tasks.get(id).cloned())
    }

    async fn reconcile(
        &self,
        project_id: &str,
        listing: &[SourceFile],
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let mut state = self.state.write().expect("lock poisoned");
        if !state.projects.contains_key(project_id) {
            return Err(ConsistencyError::ProjectNotFound(project_id.to_string()).into());
        }

        let existing: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        // Planning can fail; nothing has been written yet at that point.
        let (plan, unchanged) = plan(&existing, listing)?;

        for id in &plan.abandon {
            if let Some(task) = state.tasks.get_mut(id) {
                task.abandoned = true;
            }
        }
        for id in &plan.restore {
            if let Some(task) = state.tasks.get_mut(id) {
                task.abandoned = false;
            }
        }
        for (id, name) in &plan.rename {
            if let Some(task) = state.tasks.get_mut(id) {
                task.name = name.clone();
            }
        }
        for file in &plan.create {
            let task = Task::new(project_id, file, now);
            state.tasks.insert(task.id.clone(), task);
        }

        Ok(plan.summary(unchanged))
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        last_ocr: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| ConsistencyError::TaskNotFound(id.to_string()))?;
        task.status = status;
        if last_ocr.is_some() {
            task.last_ocr = last_ocr;
        }
        Ok(())
    }

    async fn get_ocr_result(&self, id: &str) -> Result<Option<OcrResult>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.ocr_results.get(id).cloned())
    }

    async fn list_ocr_results(&self, task_id: &str) -> Result<Vec<OcrResult>> {
        let state = self.state.read().expect("lock poisoned");
        let mut results: Vec<OcrResult> = state
            .ocr_results
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(results)
    }

    async fn save_ocr_result(&self, result: &OcrResult) -> Result<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let task = state
            .tasks
            .get_mut(&result.task_id)
            .ok_or_else(|| ConsistencyError::TaskNotFound(result.task_id.clone()))?;
        task.ocr_id = Some(result.id.clone());
        task.status = TaskStatus::Ready;
        state.ocr_results.insert(result.id.clone(), result.clone());
        Ok(())
    }
}
