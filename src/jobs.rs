//! Job handlers for the dispatcher queues.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use mrkr_core::error::ConsistencyError;

use crate::dispatcher::{Dispatcher, JobHandler};
use crate::ocr::{begin_ocr, run_ocr};
use crate::scan::{request_project_ocr, run_scan};
use crate::services::Services;

pub const SCAN_PROJECT: &str = "scan-project";
pub const RUN_OCR: &str = "run-ocr";

#[derive(Debug, Deserialize)]
struct ScanPayload {
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct OcrPayload {
    task_id: String,
    #[serde(default)]
    force: bool,
}

/// Scans one project, then queues OCR when `auto_ocr` is on.
pub struct ScanProjectJob {
    services: Services,
    dispatcher: Dispatcher,
}

#[async_trait]
impl JobHandler for ScanProjectJob {
    fn kind(&self) -> &str {
        SCAN_PROJECT
    }

    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: ScanPayload =
            serde_json::from_value(payload).context("invalid scan-project payload")?;
        run_scan(&self.services, &payload.project_id).await?;

        if self.services.auto_ocr {
            let queued =
                request_project_ocr(&self.services, &self.dispatcher, &payload.project_id, false)
                    .await?;
            info!(project = %payload.project_id, queued, "Queued OCR after scan");
        }
        Ok(())
    }
}

pub struct RunOcrJob {
    services: Services,
}

#[async_trait]
impl JobHandler for RunOcrJob {
    fn kind(&self) -> &str {
        RUN_OCR
    }

    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: OcrPayload =
            serde_json::from_value(payload).context("invalid run-ocr payload")?;

        // An earlier job for the same task may already have settled it.
        // A forced pass still owes a recognition, so re-enter pending.
        if payload.force {
            let task = self
                .services
                .store
                .get_task(&payload.task_id)
                .await?
                .ok_or_else(|| ConsistencyError::TaskNotFound(payload.task_id.clone()))?;
            if !task.status.is_busy() && !begin_ocr(&self.services, &task).await? {
                return Ok(());
            }
        }
        run_ocr(&self.services, &payload.task_id, payload.force).await?;
        Ok(())
    }
}

/// A dispatcher with both mrkr queues registered.
pub fn start_dispatcher(services: &Services) -> Result<Dispatcher> {
    let dispatcher = Dispatcher::new();
    dispatcher.register(Arc::new(ScanProjectJob {
        services: services.clone(),
        dispatcher: dispatcher.clone(),
    }))?;
    dispatcher.register(Arc::new(RunOcrJob {
        services: services.clone(),
    }))?;
    Ok(dispatcher)
}
