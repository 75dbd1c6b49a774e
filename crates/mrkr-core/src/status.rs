//! Project and task lifecycle states.
//!
//! ```text
//! Project:  ready ──▶ scan_pending ──▶ scan_running ──▶ ready
//!             ▲            ▲                 │
//!             │            └── scan_failed ◀─┘
//!
//! Task:     ready ──▶ ocr_pending ──▶ ocr_running ──▶ ready
//!                          ▲                 ├──────▶ ocr_failed
//!                          │                 └──────▶ error
//!                          └──── (retry from ocr_failed / error)
//! ```
//!
//! Re-entering `*_pending` from `*_pending` or `*_running` is legal only once
//! the staleness window has elapsed since the entity's last attempt. This is
//! the only recovery path for work orphaned by a crashed worker.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Project, Task};

/// Default staleness window.
pub const DEFAULT_STALENESS_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Ready,
    ScanPending,
    ScanRunning,
    ScanFailed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Ready => "ready",
            ProjectStatus::ScanPending => "scan_pending",
            ProjectStatus::ScanRunning => "scan_running",
            ProjectStatus::ScanFailed => "scan_failed",
        }
    }

    /// Is `self -> next` an edge of the project state machine?
    ///
    /// `scan_pending -> scan_pending` and `scan_running -> scan_pending` are
    /// structurally legal; whether they are allowed *now* is decided by
    /// [`is_scannable`].
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Ready, ScanPending)
                | (ScanFailed, ScanPending)
                | (ScanPending, ScanPending)
                | (ScanRunning, ScanPending)
                | (ScanPending, ScanRunning)
                | (ScanRunning, Ready)
                | (ScanRunning, ScanFailed)
        )
    }

    /// States that hold the entity while work is queued or in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, ProjectStatus::ScanPending | ProjectStatus::ScanRunning)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ready" => ProjectStatus::Ready,
            "scan_pending" => ProjectStatus::ScanPending,
            "scan_running" => ProjectStatus::ScanRunning,
            "scan_failed" => ProjectStatus::ScanFailed,
            other => bail!("unknown project status: '{}'", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    OcrPending,
    OcrRunning,
    OcrFailed,
    /// The task's source file could not be resolved during OCR.
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::OcrPending => "ocr_pending",
            TaskStatus::OcrRunning => "ocr_running",
            TaskStatus::OcrFailed => "ocr_failed",
            TaskStatus::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Ready, OcrPending)
                | (OcrFailed, OcrPending)
                | (Error, OcrPending)
                | (OcrPending, OcrPending)
                | (OcrRunning, OcrPending)
                | (OcrPending, OcrRunning)
                | (OcrRunning, Ready)
                | (OcrRunning, OcrFailed)
                | (OcrRunning, Error)
        )
    }

    pub fn is_busy(self) -> bool {
        matches!(self, TaskStatus::OcrPending | TaskStatus::OcrRunning)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ready" => TaskStatus::Ready,
            "ocr_pending" => TaskStatus::OcrPending,
            "ocr_running" => TaskStatus::OcrRunning,
            "ocr_failed" => TaskStatus::OcrFailed,
            "error" => TaskStatus::Error,
            other => bail!("unknown task status: '{}'", other),
        })
    }
}

/// Has the staleness window elapsed since `last_attempt`?
///
/// A missing timestamp counts as stale.
pub fn is_stale(last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match last_attempt {
        Some(ts) => now.signed_duration_since(ts) >= window,
        None => true,
    }
}

/// May a new scan of `project` be scheduled at `now`?
pub fn is_scannable(project: &Project, now: DateTime<Utc>, window: Duration) -> bool {
    if project.status.is_busy() {
        is_stale(project.last_scan, now, window)
    } else {
        true
    }
}

/// May `task` enter `ocr_pending` at `now`? Abandoned tasks never may.
pub fn is_ocr_eligible(task: &Task, now: DateTime<Utc>, window: Duration) -> bool {
    if task.abandoned {
        return false;
    }
    if task.status.is_busy() {
        is_stale(task.last_ocr, now, window)
    } else {
        true
    }
}
