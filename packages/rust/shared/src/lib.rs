//! Shared types, error model, and configuration for scanmark.
//!
//! This crate is the foundation depended on by all other scanmark crates.
//! It provides:
//! - [`ScanmarkError`]: the unified error type
//! - The assessment layout and version table ([`AssessmentLayout`], [`PqvTable`])
//! - Domain records for bundles, pages, groups, tasks, annotations and rubrics
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod layout;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, PqvConfig, ScanningConfig, TaskPolicyConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_config,
};
pub use error::{Result, ScanmarkError};
pub use layout::{
    AssessmentLayout, MAX_PAGES, MAX_PAPER, MAX_VERSIONS, PageRole, PqvRow, PqvTable,
    QuestionLayout, SelectPolicy,
};
pub use types::{
    Annotation, AnnotationId, Bundle, BundleId, BundleStatus, BundleSummary, Caller,
    ExtraAssignment, GroupKind, GroupRecord, IdPrediction, ImageId, Lease, MarkSubmission,
    PageClassification, PageKind, PaperIdentity, PaperStatus, Permission, Role, Rubric,
    RubricDraft, RubricId, RubricKind, RubricPatch, RubricRef, ScannedPage, Task, TaskFilter,
    TaskId, TaskKind, TaskStatus, USER_TAG_PREFIX, user_tag,
};
