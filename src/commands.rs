//! CLI command implementations. Results go to stdout; logs go to stderr.

use anyhow::{bail, Result};
use chrono::Utc;

use mrkr_core::error::ConsistencyError;
use mrkr_core::models::{NewProject, ProviderKind, SourceLocator, Task};

use crate::config::Config;
use crate::ocr::{begin_ocr, ocr_project, run_ocr, OcrOutcome};
use crate::scan::{begin_scan, run_scan};
use crate::services::Services;

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    for task in tasks {
        let flag = if task.abandoned { " (abandoned)" } else { "" };
        println!(
            "{}  {:<12}  {}  {}{}",
            task.id, task.status, task.uri, task.name, flag
        );
    }
}

pub async fn run_project_create(
    config: &Config,
    name: &str,
    provider: ProviderKind,
    uri: &str,
    description: Option<String>,
) -> Result<()> {
    if name.trim().is_empty() {
        bail!("project name must not be empty");
    }
    let services = Services::from_config(config).await?;
    let project = services
        .store
        .create_project(
            NewProject {
                name: name.to_string(),
                description: description.unwrap_or_default(),
                source: SourceLocator {
                    provider,
                    uri: uri.to_string(),
                },
            },
            Utc::now(),
        )
        .await?;
    println!("Created project {} ({})", project.id, project.name);
    Ok(())
}

pub async fn run_project_list(config: &Config) -> Result<()> {
    let services = Services::from_config(config).await?;
    let projects = services.store.list_projects().await?;
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }
    for project in projects {
        println!(
            "{}  {:<12}  {}  {}:{}",
            project.id, project.status, project.name, project.source.provider, project.source.uri
        );
    }
    Ok(())
}

pub async fn run_project_show(config: &Config, id: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    let project = services
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| ConsistencyError::ProjectNotFound(id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&project)?);
    Ok(())
}

pub async fn run_tasks(config: &Config, project_id: &str, all: bool) -> Result<()> {
    let services = Services::from_config(config).await?;
    let tasks: Vec<Task> = services
        .store
        .list_tasks(project_id)
        .await?
        .into_iter()
        .filter(|t| all || !t.abandoned)
        .collect();
    print_tasks(&tasks);
    Ok(())
}

/// Scan in the foreground, then OCR when `auto_ocr` is set and `no_ocr` is not.
pub async fn run_scan_cmd(config: &Config, project_id: &str, no_ocr: bool) -> Result<()> {
    let services = Services::from_config(config).await?;
    if !begin_scan(&services, project_id).await? {
        println!("A scan of {} is already in progress.", project_id);
        return Ok(());
    }
    let summary = run_scan(&services, project_id).await?;
    println!(
        "Scan complete: {} created, {} renamed, {} restored, {} abandoned, {} unchanged",
        summary.created, summary.renamed, summary.restored, summary.abandoned, summary.unchanged
    );

    if services.auto_ocr && !no_ocr {
        let sweep = ocr_project(&services, project_id, false).await?;
        println!(
            "OCR: {} recognized, {} cached, {} failed, {} skipped",
            sweep.recognized, sweep.cache_hits, sweep.failed, sweep.skipped
        );
    }
    Ok(())
}

/// OCR one task, or every live task of a project, in the foreground.
pub async fn run_ocr_cmd(
    config: &Config,
    project_id: &str,
    task_id: Option<&str>,
    force: bool,
) -> Result<()> {
    let services = Services::from_config(config).await?;

    let Some(task_id) = task_id else {
        let sweep = ocr_project(&services, project_id, force).await?;
        println!(
            "OCR: {} recognized, {} cached, {} failed, {} skipped",
            sweep.recognized, sweep.cache_hits, sweep.failed, sweep.skipped
        );
        return Ok(());
    };

    let task = services
        .store
        .get_task(task_id)
        .await?
        .filter(|t| t.project_id == project_id)
        .ok_or_else(|| ConsistencyError::TaskNotFound(task_id.to_string()))?;
    if !begin_ocr(&services, &task).await? {
        println!("OCR of {} is already in progress.", task_id);
        return Ok(());
    }
    match run_ocr(&services, task_id, force).await? {
        OcrOutcome::CacheHit => println!("{}: unchanged, cached result kept", task_id),
        OcrOutcome::Recognized { pages, blocks } => {
            println!("{}: {} pages, {} blocks", task_id, pages, blocks)
        }
        OcrOutcome::Failed { status, reason } => {
            bail!("{}: {} ({})", task_id, status, reason)
        }
    }
    Ok(())
}
