//! Shared handles used by the pipelines, the job handlers and the server.

use std::sync::Arc;

use anyhow::Result;

use mrkr_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::recognize::{recognizer_from_config, Recognizer};
use crate::source::Sources;
use crate::sqlite_store::SqliteStore;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub sources: Sources,
    pub recognizer: Arc<dyn Recognizer>,
    /// How long a pending/running entity blocks re-entry.
    pub staleness: chrono::Duration,
    /// Queue OCR for a project's tasks after each successful scan.
    pub auto_ocr: bool,
}

impl Services {
    /// Connect to the configured database and build every adapter.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        Ok(Self {
            store: Arc::new(SqliteStore::new(pool)),
            sources: Sources::from_config(config),
            recognizer: recognizer_from_config(&config.ocr)?,
            staleness: config.scan.staleness_window(),
            auto_ocr: config.scan.auto_ocr,
        })
    }
}
