//! Reconciliation of a source listing against a project's tasks.
//!
//! [`plan`] is pure: it takes the tasks currently stored for a project and the
//! files the content source reports right now, and decides which tasks to
//! create, rename, restore, or abandon. Stores apply the plan atomically.
//!
//! The listing's etag is deliberately ignored here. Whether a task's OCR is
//! still fresh is decided by the OCR pipeline, which recomputes the checksum.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use serde::Serialize;

use crate::error::ConsistencyError;
use crate::models::{SourceFile, Task};

/// Changes needed to bring a project's tasks in line with a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Listing entries with no task yet, in listing order.
    pub create: Vec<SourceFile>,
    /// `(task_id, new_name)`.
    pub rename: Vec<(String, String)>,
    /// Abandoned tasks whose file reappeared.
    pub restore: Vec<String>,
    /// Live tasks whose file disappeared.
    pub abandon: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.rename.is_empty()
            && self.restore.is_empty()
            && self.abandon.is_empty()
    }

    pub fn summary(&self, unchanged: usize) -> ReconcileSummary {
        ReconcileSummary {
            created: self.create.len(),
            renamed: self.rename.len(),
            restored: self.restore.len(),
            abandoned: self.abandon.len(),
            unchanged,
        }
    }
}

/// Counts reported after a plan has been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub renamed: usize,
    pub restored: usize,
    pub abandoned: usize,
    pub unchanged: usize,
}

/// Pick the task that represents `uri` when several rows share it.
///
/// A live task always wins. Among abandoned ones the most recently created is
/// kept so that the newest history is the one brought back.
fn representative<'a>(candidates: &[&'a Task]) -> &'a Task {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            (!a.abandoned, a.created, &a.id).cmp(&(!b.abandoned, b.created, &b.id))
        })
        .expect("candidates is never empty")
}

/// Compute the changes needed to reconcile `existing` with `listing`.
///
/// Fails with [`ConsistencyError::DuplicateUri`] when two listing entries
/// share a URI.
pub fn plan(existing: &[Task], listing: &[SourceFile]) -> Result<(ReconcilePlan, usize)> {
    let mut origin: BTreeMap<&str, &SourceFile> = BTreeMap::new();
    for file in listing {
        if origin.insert(file.uri.as_str(), file).is_some() {
            return Err(ConsistencyError::DuplicateUri {
                uri: file.uri.clone(),
            }
            .into());
        }
    }

    let mut by_uri: HashMap<&str, Vec<&Task>> = HashMap::new();
    for task in existing {
        by_uri.entry(task.uri.as_str()).or_default().push(task);
    }

    let mut plan = ReconcilePlan::default();
    let mut unchanged = 0usize;
    let mut matched: HashSet<&str> = HashSet::new();

    for (uri, candidates) in &by_uri {
        let task = representative(candidates);
        match origin.get(uri) {
            Some(file) => {
                matched.insert(*uri);
                let mut touched = false;
                if task.abandoned {
                    plan.restore.push(task.id.clone());
                    touched = true;
                }
                if task.name != file.name {
                    plan.rename.push((task.id.clone(), file.name.clone()));
                    touched = true;
                }
                if !touched {
                    unchanged += 1;
                }
            }
            None => {
                for t in candidates.iter().filter(|t| !t.abandoned) {
                    plan.abandon.push(t.id.clone());
                }
            }
        }
    }

    for file in listing {
        if !matched.contains(file.uri.as_str()) {
            plan.create.push(file.clone());
        }
    }

    // HashMap iteration order is arbitrary; keep the plan deterministic.
    plan.rename.sort();
    plan.restore.sort();
    plan.abandon.sort();

    Ok((plan, unchanged))
}
