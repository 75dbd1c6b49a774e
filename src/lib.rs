//! # mrkr
//!
//! Turns a collection of source files (a local directory or an S3 prefix)
//! into persisted tasks, and drives each task through a cached OCR pipeline
//! whose output is labelable, resolution-independent text blocks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │   Sources    │──▶│ Reconcile  │──▶│  SQLite  │
//! │  local / S3  │   │  (scan)    │   │  Store   │
//! └──────┬───────┘   └────────────┘   └────┬─────┘
//!        │ to_images                        │
//!        ▼                                  ▼
//! ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │  Rasterize   │──▶│ Tesseract  │──▶│   OCR    │
//! │  pdftocairo  │   │ recognize  │   │ results  │
//! └──────────────┘   └────────────┘   └──────────┘
//! ```
//!
//! Scans and OCR runs are queued on a [`dispatcher::Dispatcher`]: one
//! FIFO worker per job kind. The status state machine and staleness window
//! in [`mrkr_core::status`] decide what may run.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite [`mrkr_core::store::Store`] |
//! | [`source`], [`source_fs`], [`source_s3`] | Content source adapters |
//! | [`raster`] | PDF / image to page images |
//! | [`recognize`] | Recognition adapters (tesseract) |
//! | [`ocr`] | Cached OCR pipeline |
//! | [`scan`] | Scan pipeline and request entry points |
//! | [`dispatcher`] / [`jobs`] | Job queues and their handlers |
//! | [`server`] | JSON HTTP API |

pub mod commands;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod jobs;
pub mod migrate;
pub mod ocr;
pub mod raster;
pub mod recognize;
pub mod scan;
pub mod server;
pub mod services;
pub mod source;
pub mod source_fs;
pub mod source_s3;
pub mod sqlite_store;
