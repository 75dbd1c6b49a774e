//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as unix milliseconds; statuses and provider kinds as
//! their snake_case strings. The two batch operations, `reconcile` and
//! `save_ocr_result`, each run inside a single transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use mrkr_core::error::ConsistencyError;
use mrkr_core::models::{
    Block, NewProject, OcrResult, Page, Project, SourceFile, SourceLocator, Task,
};
use mrkr_core::reconcile::{plan, ReconcileSummary};
use mrkr_core::status::{ProjectStatus, TaskStatus};
use mrkr_core::store::Store;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let provider: String = row.get("provider");
    let status: String = row.get("status");
    Ok(Project {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        source: SourceLocator {
            provider: provider.parse()?,
            uri: row.get("uri"),
        },
        status: status.parse()?,
        last_scan: row.get::<Option<i64>, _>("last_scan").map(from_millis),
        created: from_millis(row.get("created")),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    Ok(Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        uri: row.get("uri"),
        name: row.get("name"),
        created: from_millis(row.get("created")),
        status: status.parse()?,
        abandoned: row.get::<i64, _>("abandoned") != 0,
        last_ocr: row.get::<Option<i64>, _>("last_ocr").map(from_millis),
        ocr_id: row.get("ocr_id"),
    })
}

const TASK_COLUMNS: &str =
    "id, project_id, uri, name, created, status, abandoned, last_ocr, ocr_id";

async fn insert_task(tx: &mut Transaction<'_, Sqlite>, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, project_id, uri, name, created, status, abandoned, last_ocr, ocr_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.project_id)
    .bind(&task.uri)
    .bind(&task.name)
    .bind(to_millis(task.created))
    .bind(task.status.as_str())
    .bind(task.abandoned as i64)
    .bind(task.last_ocr.map(to_millis))
    .bind(&task.ocr_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl SqliteStore {
    async fn load_pages(&self, ocr_id: &str) -> Result<Vec<Page>> {
        let page_rows = sqlx::query(
            "SELECT id, page_index, width, height FROM ocr_pages WHERE ocr_id = ? ORDER BY page_index",
        )
        .bind(ocr_id)
        .fetch_all(&self.pool)
        .await?;

        let mut pages = Vec::with_capacity(page_rows.len());
        for row in page_rows {
            let page_id: String = row.get("id");
            let block_rows = sqlx::query(
                r#"
                SELECT type, content, confidence, left_pct, top_pct, width_pct, height_pct
                FROM ocr_blocks WHERE page_id = ? ORDER BY block_index
                "#,
            )
            .bind(&page_id)
            .fetch_all(&self.pool)
            .await?;

            let blocks = block_rows
                .iter()
                .map(|b| {
                    let kind: String = b.get("type");
                    Ok(Block {
                        kind: kind.parse()?,
                        content: b.get("content"),
                        confidence: b.get("confidence"),
                        left: b.get("left_pct"),
                        top: b.get("top_pct"),
                        width: b.get("width_pct"),
                        height: b.get("height_pct"),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            pages.push(Page {
                index: row.get::<i64, _>("page_index") as u32,
                width: row.get::<i64, _>("width") as u32,
                height: row.get::<i64, _>("height") as u32,
                blocks,
            });
        }
        Ok(pages)
    }

    async fn result_from_row(&self, row: &SqliteRow) -> Result<OcrResult> {
        let id: String = row.get("id");
        let pages = self.load_pages(&id).await?;
        Ok(OcrResult {
            task_id: row.get("task_id"),
            etag: row.get("etag"),
            provider: row.get("provider"),
            created: from_millis(row.get("created")),
            pages,
            id,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_project(&self, project: NewProject, now: DateTime<Utc>) -> Result<Project> {
        let project = project.into_project(now);
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, provider, uri, status, last_scan, created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.source.provider.as_str())
        .bind(&project.source.uri)
        .bind(project.status.as_str())
        .bind(project.last_scan.map(to_millis))
        .bind(to_millis(project.created))
        .execute(&self.pool)
        .await?;
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        last_scan: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE projects SET status = ?, last_scan = COALESCE(?, last_scan) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_scan.map(to_millis))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ConsistencyError::ProjectNotFound(id.to_string()).into());
        }
        Ok(())
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE project_id = ? ORDER BY uri, created",
            TASK_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn reconcile(
        &self,
        project_id: &str,
        listing: &[SourceFile],
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Err(ConsistencyError::ProjectNotFound(project_id.to_string()).into());
        }

        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE project_id = ?",
            TASK_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;
        let existing = rows.iter().map(task_from_row).collect::<Result<Vec<_>>>()?;

        // Dropping `tx` on any early return rolls everything back.
        let (plan, unchanged) = plan(&existing, listing)?;

        for id in &plan.abandon {
            sqlx::query("UPDATE tasks SET abandoned = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for id in &plan.restore {
            sqlx::query("UPDATE tasks SET abandoned = 0 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for (id, name) in &plan.rename {
            sqlx::query("UPDATE tasks SET name = ? WHERE id = ?")
                .bind(name)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for file in &plan.create {
            let task = Task::new(project_id, file, now);
            insert_task(&mut tx, &task)
                .await
                .with_context(|| format!("Failed to create task for {}", file.uri))?;
        }

        tx.commit().await?;
        Ok(plan.summary(unchanged))
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        last_ocr: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, last_ocr = COALESCE(?, last_ocr) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_ocr.map(to_millis))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ConsistencyError::TaskNotFound(id.to_string()).into());
        }
        Ok(())
    }

    async fn get_ocr_result(&self, id: &str) -> Result<Option<OcrResult>> {
        let row = sqlx::query("SELECT * FROM ocr_results WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.result_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_ocr_results(&self, task_id: &str) -> Result<Vec<OcrResult>> {
        let rows = sqlx::query("SELECT * FROM ocr_results WHERE task_id = ? ORDER BY created, rowid")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(self.result_from_row(row).await?);
        }
        Ok(results)
    }

    async fn save_ocr_result(&self, result: &OcrResult) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO ocr_results (id, task_id, etag, provider, created) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&result.id)
        .bind(&result.task_id)
        .bind(&result.etag)
        .bind(&result.provider)
        .bind(to_millis(result.created))
        .execute(&mut *tx)
        .await?;

        for page in &result.pages {
            let page_id = uuid::Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO ocr_pages (id, ocr_id, page_index, width, height) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&page_id)
            .bind(&result.id)
            .bind(page.index as i64)
            .bind(page.width as i64)
            .bind(page.height as i64)
            .execute(&mut *tx)
            .await?;

            for (i, block) in page.blocks.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO ocr_blocks (id, page_id, block_index, type, content, confidence,
                                            left_pct, top_pct, width_pct, height_pct)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(&page_id)
                .bind(i as i64)
                .bind(block.kind.as_str())
                .bind(&block.content)
                .bind(block.confidence)
                .bind(block.left)
                .bind(block.top)
                .bind(block.width)
                .bind(block.height)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated = sqlx::query("UPDATE tasks SET ocr_id = ?, status = ? WHERE id = ?")
            .bind(&result.id)
            .bind(TaskStatus::Ready.as_str())
            .bind(&result.task_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(ConsistencyError::TaskNotFound(result.task_id.clone()).into());
        }

        tx.commit().await?;
        Ok(())
    }
}
