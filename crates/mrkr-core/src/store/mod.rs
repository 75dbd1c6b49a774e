//! Storage abstraction for mrkr.
//!
//! The [`Store`] trait is the transactional boundary of the system. Every
//! method either commits fully or not at all; the two batch operations,
//! [`Store::reconcile`] and [`Store::save_ocr_result`], are the ones where
//! that matters most.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{NewProject, OcrResult, Project, SourceFile, Task};
use crate::reconcile::ReconcileSummary;
use crate::status::{ProjectStatus, TaskStatus};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_project`](Store::create_project) | Insert a project in `ready` state |
/// | [`update_project_status`](Store::update_project_status) | Commit a project transition |
/// | [`reconcile`](Store::reconcile) | Plan and apply a listing in one transaction |
/// | [`update_task_status`](Store::update_task_status) | Commit a task transition |
/// | [`save_ocr_result`](Store::save_ocr_result) | Persist a full result and point the task at it |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, project: NewProject, now: DateTime<Utc>) -> Result<Project>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Set `status`, and `last_scan` when given.
    async fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        last_scan: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// All tasks of a project, abandoned ones included, ordered by URI.
    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Reconcile `listing` against the project's tasks.
    ///
    /// Runs [`crate::reconcile::plan`] over the stored tasks and applies the
    /// result in a single transaction. Any failure leaves every task as it was.
    async fn reconcile(
        &self,
        project_id: &str,
        listing: &[SourceFile],
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary>;

    /// Set `status`, and `last_ocr` when given.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        last_ocr: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn get_ocr_result(&self, id: &str) -> Result<Option<OcrResult>>;

    /// Every result ever produced for a task, oldest first.
    async fn list_ocr_results(&self, task_id: &str) -> Result<Vec<OcrResult>>;

    /// Persist `result` with all pages and blocks, then point its task at it
    /// and mark the task `ready`. The task never references a partial result.
    async fn save_ocr_result(&self, result: &OcrResult) -> Result<()>;
}
