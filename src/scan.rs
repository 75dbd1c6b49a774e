//! Scan pipeline and the request entry points for scans and OCR.
//!
//! `request_*` functions check eligibility, commit the pending state, and
//! enqueue a job. They return `false`, not an error, while an earlier
//! attempt is still inside its staleness window.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use mrkr_core::error::ConsistencyError;
use mrkr_core::models::{Project, Task};
use mrkr_core::reconcile::ReconcileSummary;
use mrkr_core::status::{is_scannable, ProjectStatus};

use crate::dispatcher::Dispatcher;
use crate::jobs::{RUN_OCR, SCAN_PROJECT};
use crate::ocr::begin_ocr;
use crate::services::Services;

async fn load_project(services: &Services, project_id: &str) -> Result<Project> {
    services
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| ConsistencyError::ProjectNotFound(project_id.to_string()).into())
}

fn ensure_project_transition(project: &Project, to: ProjectStatus) -> Result<()> {
    if project.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(ConsistencyError::IllegalProjectTransition {
            project_id: project.id.clone(),
            from: project.status,
            to,
        }
        .into())
    }
}

/// Commit `scan_pending` if the project is scannable now.
pub async fn begin_scan(services: &Services, project_id: &str) -> Result<bool> {
    let project = load_project(services, project_id).await?;
    let now = Utc::now();
    if !is_scannable(&project, now, services.staleness) {
        return Ok(false);
    }
    ensure_project_transition(&project, ProjectStatus::ScanPending)?;
    services
        .store
        .update_project_status(&project.id, ProjectStatus::ScanPending, Some(now))
        .await?;
    Ok(true)
}

/// Mark the project pending and queue a `scan-project` job.
pub async fn request_scan(
    services: &Services,
    dispatcher: &Dispatcher,
    project_id: &str,
) -> Result<bool> {
    let prior = load_project(services, project_id).await?;
    if !begin_scan(services, project_id).await? {
        return Ok(false);
    }
    if let Err(e) = dispatcher.put(SCAN_PROJECT, json!({ "project_id": project_id })) {
        services
            .store
            .update_project_status(&prior.id, prior.status, prior.last_scan)
            .await?;
        return Err(e);
    }
    Ok(true)
}

/// Mark the task pending and queue a `run-ocr` job.
pub async fn request_ocr(
    services: &Services,
    dispatcher: &Dispatcher,
    task_id: &str,
    force: bool,
) -> Result<bool> {
    let task = services
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ConsistencyError::TaskNotFound(task_id.to_string()))?;
    if !begin_ocr(services, &task).await? {
        return Ok(false);
    }
    enqueue_ocr(services, dispatcher, &task, force).await?;
    Ok(true)
}

/// Queue a `run-ocr` job for a task just moved to `ocr_pending`. If the
/// queue refuses it, the task goes back to where it was.
async fn enqueue_ocr(
    services: &Services,
    dispatcher: &Dispatcher,
    prior: &Task,
    force: bool,
) -> Result<()> {
    if let Err(e) = dispatcher.put(RUN_OCR, json!({ "task_id": prior.id, "force": force })) {
        services
            .store
            .update_task_status(&prior.id, prior.status, prior.last_ocr)
            .await?;
        return Err(e);
    }
    Ok(())
}

/// Queue OCR for every live, eligible task of a project. Returns how many
/// jobs were queued.
pub async fn request_project_ocr(
    services: &Services,
    dispatcher: &Dispatcher,
    project_id: &str,
    force: bool,
) -> Result<usize> {
    let mut queued = 0;
    for task in services.store.list_tasks(project_id).await? {
        if task.abandoned || !begin_ocr(services, &task).await? {
            continue;
        }
        enqueue_ocr(services, dispatcher, &task, force).await?;
        queued += 1;
    }
    Ok(queued)
}

/// Scan a project that is in `scan_pending`.
///
/// Commits `scan_running`, lists the source, and reconciles the listing in
/// one transaction. Any failure after `scan_running` leaves the project in
/// `scan_failed` with every task untouched, and is returned.
#[instrument(skip(services))]
pub async fn run_scan(services: &Services, project_id: &str) -> Result<ReconcileSummary> {
    let project = load_project(services, project_id).await?;
    ensure_project_transition(&project, ProjectStatus::ScanRunning)?;
    services
        .store
        .update_project_status(&project.id, ProjectStatus::ScanRunning, Some(Utc::now()))
        .await?;

    match list_and_reconcile(services, &project).await {
        Ok(summary) => {
            services
                .store
                .update_project_status(&project.id, ProjectStatus::Ready, Some(Utc::now()))
                .await?;
            info!(
                project = %project.id,
                created = summary.created,
                renamed = summary.renamed,
                restored = summary.restored,
                abandoned = summary.abandoned,
                unchanged = summary.unchanged,
                "Scan complete"
            );
            Ok(summary)
        }
        Err(e) => {
            warn!(project = %project.id, "Scan failed: {:#}", e);
            services
                .store
                .update_project_status(&project.id, ProjectStatus::ScanFailed, Some(Utc::now()))
                .await?;
            Err(e)
        }
    }
}

async fn list_and_reconcile(services: &Services, project: &Project) -> Result<ReconcileSummary> {
    let source = services.sources.get(project.source.provider)?;
    let listing = source
        .list_files(&project.source.uri)
        .await
        .with_context(|| format!("cannot list {}", project.source.uri))?;
    services
        .store
        .reconcile(&project.id, &listing, Utc::now())
        .await
}
