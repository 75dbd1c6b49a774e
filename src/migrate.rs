use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool.
///
/// Timestamps are unix milliseconds. Tasks are never deleted, so the
/// one-live-task-per-uri rule is a partial unique index over non-abandoned rows.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            provider TEXT NOT NULL,
            uri TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready',
            last_scan INTEGER,
            created INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            uri TEXT NOT NULL,
            name TEXT NOT NULL,
            created INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready',
            abandoned INTEGER NOT NULL DEFAULT 0,
            last_ocr INTEGER,
            ocr_id TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ocr_results (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            etag TEXT NOT NULL,
            provider TEXT NOT NULL,
            created INTEGER NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ocr_pages (
            id TEXT PRIMARY KEY,
            ocr_id TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            UNIQUE(ocr_id, page_index),
            FOREIGN KEY (ocr_id) REFERENCES ocr_results(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ocr_blocks (
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL,
            block_index INTEGER NOT NULL,
            type TEXT NOT NULL,
            content TEXT NOT NULL,
            confidence REAL,
            left_pct REAL NOT NULL,
            top_pct REAL NOT NULL,
            width_pct REAL NOT NULL,
            height_pct REAL NOT NULL,
            UNIQUE(page_id, block_index),
            FOREIGN KEY (page_id) REFERENCES ocr_pages(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_uri ON tasks(project_id, uri) WHERE abandoned = 0",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project_id ON tasks(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ocr_results_task_id ON ocr_results(task_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ocr_blocks_page_id ON ocr_blocks(page_id)")
        .execute(pool)
        .await?;

    Ok(())
}
