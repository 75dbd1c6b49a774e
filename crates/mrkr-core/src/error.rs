//! Typed domain errors.
//!
//! Everything else travels as [`anyhow::Error`]; these types exist so the
//! pipelines can tell integration mistakes and vanished files apart from
//! ordinary adapter failures with `downcast_ref`.

use thiserror::Error;

use crate::status::{ProjectStatus, TaskStatus};

/// A programming or integration error. Raised, never converted into a
/// status, and aborts the current batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// Two listing entries share one URI.
    #[error("duplicate uri in source listing: {uri}")]
    DuplicateUri { uri: String },

    /// OCR was requested for a task whose source file is gone.
    #[error("task {task_id} is abandoned and cannot be processed")]
    AbandonedTask { task_id: String },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("illegal project transition for {project_id}: {from} -> {to}")]
    IllegalProjectTransition {
        project_id: String,
        from: ProjectStatus,
        to: ProjectStatus,
    },

    #[error("illegal task transition for {task_id}: {from} -> {to}")]
    IllegalTaskTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Failure reported by a content source adapter.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The URI no longer resolves to a file.
    #[error("source file not found: {uri}")]
    NotFound { uri: String },
}

/// Returns `true` if any error in the chain is [`SourceError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<SourceError>(),
            Some(SourceError::NotFound { .. })
        )
    })
}

/// Returns `true` if any error in the chain is a [`ConsistencyError`].
pub fn is_consistency_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ConsistencyError>().is_some())
}
