//! Core data models.
//!
//! A [`Project`] points at a collection of source files. Each file becomes a
//! [`Task`], and each successful recognition pass over a task's file becomes
//! an [`OcrResult`] made of [`Page`]s and [`Block`]s.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{ProjectStatus, TaskStatus};

/// Which content source adapter serves a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    S3,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::S3 => "s3",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "local" => ProviderKind::Local,
            "s3" => ProviderKind::S3,
            other => bail!("unknown source provider: '{}'. Must be local or s3.", other),
        })
    }
}

/// Provider kind plus the URI pattern handed to its `list_files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocator {
    pub provider: ProviderKind,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: SourceLocator,
    pub status: ProjectStatus,
    /// Last scan transition (pending, running, or completion).
    pub last_scan: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// Input for creating a project.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source: SourceLocator,
}

impl NewProject {
    /// Build the stored project with a fresh id and `ready` status.
    pub fn into_project(self, now: DateTime<Utc>) -> Project {
        Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            source: self.source,
            status: ProjectStatus::Ready,
            last_scan: None,
            created: now,
        }
    }
}

/// One unit of work: the lifecycle of one source file within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    /// Stable identity of the source file, unique among live tasks.
    pub uri: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub status: TaskStatus,
    /// The source file vanished from the latest listing.
    pub abandoned: bool,
    /// Last OCR transition (pending or running).
    pub last_ocr: Option<DateTime<Utc>>,
    pub ocr_id: Option<String>,
}

impl Task {
    pub fn new(project_id: &str, file: &SourceFile, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            uri: file.uri.clone(),
            name: file.name.clone(),
            created: now,
            status: TaskStatus::Ready,
            abandoned: false,
            last_ocr: None,
            ocr_id: None,
        }
    }
}

/// A file as reported by a content source listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub uri: String,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Word,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Word => "word",
        }
    }
}

impl FromStr for BlockKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "word" => Ok(BlockKind::Word),
            other => bail!("unknown block type: '{}'", other),
        }
    }
}

/// A recognized text region. Coordinates are percentages of the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: BlockKind,
    pub content: String,
    pub confidence: Option<f64>,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 0-based.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub id: String,
    pub task_id: String,
    /// Content checksum of the source file when recognition ran.
    pub etag: String,
    pub provider: String,
    pub created: DateTime<Utc>,
    pub pages: Vec<Page>,
}

impl OcrResult {
    pub fn block_count(&self) -> usize {
        self.pages.iter().map(|p| p.blocks.len()).sum()
    }
}

/// A region as returned by a recognition adapter, in source pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedRegion {
    pub content: String,
    pub confidence: Option<f64>,
    pub left_px: f64,
    pub top_px: f64,
    pub width_px: f64,
    pub height_px: f64,
}
