//! OCR pipeline with a content-addressed cache.
//!
//! A task is recognized only when no stored result matches the current
//! content checksum of its file, or when forced. Adapter failures become a
//! task status (`error` for a vanished file, `ocr_failed` otherwise);
//! consistency and store failures are returned as errors.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use mrkr_core::error::{is_consistency_error, is_not_found, ConsistencyError};
use mrkr_core::models::{OcrResult, Task};
use mrkr_core::normalize::build_page;
use mrkr_core::status::{is_ocr_eligible, TaskStatus};

use crate::services::Services;

/// What one `run_ocr` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OcrOutcome {
    /// The stored result already matches the file's content.
    CacheHit,
    Recognized { pages: usize, blocks: usize },
    Failed { status: TaskStatus, reason: String },
}

/// Counts from an [`ocr_project`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OcrSweep {
    pub recognized: usize,
    pub cache_hits: usize,
    pub failed: usize,
    /// Tasks still inside their staleness window.
    pub skipped: usize,
}

/// Move `task` into `ocr_pending` if it is eligible right now.
///
/// Returns `false` when the task is busy and its staleness window has not
/// elapsed. Abandoned tasks are a consistency error.
pub async fn begin_ocr(services: &Services, task: &Task) -> Result<bool> {
    if task.abandoned {
        return Err(ConsistencyError::AbandonedTask {
            task_id: task.id.clone(),
        }
        .into());
    }
    let now = Utc::now();
    if !is_ocr_eligible(task, now, services.staleness) {
        return Ok(false);
    }
    ensure_task_transition(task, TaskStatus::OcrPending)?;
    services
        .store
        .update_task_status(&task.id, TaskStatus::OcrPending, Some(now))
        .await?;
    Ok(true)
}

fn ensure_task_transition(task: &Task, to: TaskStatus) -> Result<()> {
    if task.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(ConsistencyError::IllegalTaskTransition {
            task_id: task.id.clone(),
            from: task.status,
            to,
        }
        .into())
    }
}

/// Run OCR for a task that is in `ocr_pending`.
///
/// Commits `ocr_running` before any adapter call, then either a cache hit
/// (`ready`), a new result (`ready`, task points at it), or a failure
/// status. The task only ever references a fully persisted result.
#[instrument(skip(services))]
pub async fn run_ocr(services: &Services, task_id: &str, force: bool) -> Result<OcrOutcome> {
    let store = &services.store;
    let task = store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ConsistencyError::TaskNotFound(task_id.to_string()))?;
    if task.abandoned {
        return Err(ConsistencyError::AbandonedTask {
            task_id: task.id.clone(),
        }
        .into());
    }
    ensure_task_transition(&task, TaskStatus::OcrRunning)?;
    store
        .update_task_status(&task.id, TaskStatus::OcrRunning, Some(Utc::now()))
        .await?;

    match recognize_task(services, &task, force).await {
        Ok(Some(result)) => {
            let outcome = OcrOutcome::Recognized {
                pages: result.pages.len(),
                blocks: result.block_count(),
            };
            match store.save_ocr_result(&result).await {
                Ok(()) => {
                    info!(task = %task.id, ocr = %result.id, "OCR complete");
                    Ok(outcome)
                }
                Err(e) if is_consistency_error(&e) => Err(e),
                Err(e) => {
                    let e = e.context("Failed to save OCR result");
                    fail_task(services, &task, TaskStatus::OcrFailed, &e).await
                }
            }
        }
        Ok(None) => {
            store
                .update_task_status(&task.id, TaskStatus::Ready, None)
                .await?;
            debug!(task = %task.id, "OCR cache hit");
            Ok(OcrOutcome::CacheHit)
        }
        Err(e) if is_consistency_error(&e) => Err(e),
        Err(e) => {
            let status = if is_not_found(&e) {
                TaskStatus::Error
            } else {
                TaskStatus::OcrFailed
            };
            fail_task(services, &task, status, &e).await
        }
    }
}

/// Leave `ocr_running` for a terminal failure status.
async fn fail_task(
    services: &Services,
    task: &Task,
    status: TaskStatus,
    err: &anyhow::Error,
) -> Result<OcrOutcome> {
    services
        .store
        .update_task_status(&task.id, status, None)
        .await?;
    let reason = format!("{:#}", err);
    warn!(task = %task.id, %status, reason = %reason, "OCR failed");
    Ok(OcrOutcome::Failed { status, reason })
}

/// The adapter-facing part of [`run_ocr`]. `None` means cache hit.
async fn recognize_task(services: &Services, task: &Task, force: bool) -> Result<Option<OcrResult>> {
    let project = services
        .store
        .get_project(&task.project_id)
        .await?
        .ok_or_else(|| ConsistencyError::ProjectNotFound(task.project_id.clone()))?;
    let source = services.sources.get(project.source.provider)?;
    let provider = services.recognizer.provider().to_string();

    let etag = source
        .checksum(&task.uri)
        .await
        .with_context(|| format!("cannot checksum {}", task.uri))?;

    if !force {
        if let Some(ocr_id) = &task.ocr_id {
            if let Some(previous) = services.store.get_ocr_result(ocr_id).await? {
                if previous.etag == etag && previous.provider == provider {
                    return Ok(None);
                }
            }
        }
    }

    let images = source
        .to_images(&task.uri)
        .await
        .with_context(|| format!("cannot rasterize {}", task.uri))?;

    let mut pages = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let regions = services
            .recognizer
            .recognize(image)
            .await
            .with_context(|| format!("recognition failed on page {}", index))?;
        pages.push(build_page(index as u32, image.width, image.height, &regions)?);
    }

    Ok(Some(OcrResult {
        id: uuid::Uuid::new_v4().to_string(),
        task_id: task.id.clone(),
        etag,
        provider,
        created: Utc::now(),
        pages,
    }))
}

/// OCR every live task of a project in turn.
///
/// One task's failure does not stop the sweep. Consistency errors do.
#[instrument(skip(services))]
pub async fn ocr_project(services: &Services, project_id: &str, force: bool) -> Result<OcrSweep> {
    services
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| ConsistencyError::ProjectNotFound(project_id.to_string()))?;

    let mut sweep = OcrSweep::default();
    let tasks = services.store.list_tasks(project_id).await?;
    for task in tasks.iter().filter(|t| !t.abandoned) {
        if !begin_ocr(services, task).await? {
            sweep.skipped += 1;
            continue;
        }
        match run_ocr(services, &task.id, force).await {
            Ok(OcrOutcome::CacheHit) => sweep.cache_hits += 1,
            Ok(OcrOutcome::Recognized { .. }) => sweep.recognized += 1,
            Ok(OcrOutcome::Failed { .. }) => sweep.failed += 1,
            Err(e) if is_consistency_error(&e) => return Err(e),
            Err(e) => {
                warn!(task = %task.id, "OCR aborted: {:#}", e);
                sweep.failed += 1;
            }
        }
    }
    Ok(sweep)
}
