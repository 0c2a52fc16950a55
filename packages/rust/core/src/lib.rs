//! Core domain logic for scanmark.
//!
//! This crate ties together page-code classification, storage and policy
//! into the operations the CLI exposes: version-map generation, bundle
//! ingestion and review, paper assembly, task leasing and rubric revision.

pub mod access;
pub mod assembler;
pub mod ingest;
pub mod pqv;
pub mod review;
pub mod rubrics;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use assembler::{PaperAssembler, reconcile, reconcile_all};
pub use ingest::{BundleUpload, IngestTicket, PageScan, ProgressReporter, SilentProgress, ingest};
pub use review::ReviewOutcome;
pub use rubrics::RubricLedger;
pub use tasks::TaskEngine;
