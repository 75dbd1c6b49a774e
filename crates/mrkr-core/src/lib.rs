//! # mrkr core
//!
//! Runtime-free logic shared by every mrkr backend: the data model, the
//! project/task status state machine, the reconciliation planner, OCR
//! coordinate normalization, and the [`store::Store`] abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! runtime-specific dependencies.

pub mod checksum;
pub mod error;
pub mod models;
pub mod normalize;
pub mod reconcile;
pub mod status;
pub mod store;
