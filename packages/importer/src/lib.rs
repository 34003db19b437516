#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Import job orchestrator for the Community Notes public dataset.
//!
//! The dataset is published daily as sequentially numbered ZIP archives,
//! each wrapping one TSV payload. An import job walks through three
//! phases: discover the newest published date and its file count,
//! download (or reuse cached) archives and extract the TSVs, then
//! truncate the `notes` table and bulk-load every payload with `COPY`.
//! All observable state lives in the `import_jobs` row — the status
//! endpoints always re-read it, and cancellation is cooperative, polled
//! at phase and per-file checkpoints.

pub mod config;
pub mod discovery;
pub mod fetch;
pub mod loader;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;

pub use config::ImporterConfig;
pub use orchestrator::{ImportContext, spawn_import};
pub use scheduler::{SchedulerState, run_scheduler};
