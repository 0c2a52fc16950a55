//! Error types for scanmark.
//!
//! Library crates use [`ScanmarkError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Every variant an operator can act on carries the paper, page, task or
//! bundle it concerns. Nothing is folded into a generic message.

use std::path::PathBuf;

/// Top-level error type for all scanmark operations.
#[derive(Debug, thiserror::Error)]
pub enum ScanmarkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad layout, bad input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Text parsing error (PQV tables, manifests).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A page code could not be decoded.
    #[error("invalid page code {code:?}: {reason}")]
    InvalidCode { code: String, reason: String },

    /// The same file content was already uploaded under another name.
    #[error("bundle {name:?} duplicates existing bundle {existing_name:?} (sha256 {hash})")]
    DuplicateBundle {
        name: String,
        existing_name: String,
        hash: String,
    },

    /// A bundle with this name exists but its content differs.
    #[error("bundle {name:?} already exists with sha256 {existing_hash}, upload has {hash}")]
    BundleNameHashMismatch {
        name: String,
        existing_hash: String,
        hash: String,
    },

    /// A bundle still has pages awaiting manual disposition.
    #[error(
        "bundle {bundle} is not ready: {unknown} unknown, {collisions} collisions, \
         {unassigned_extra} unassigned extra pages"
    )]
    BundleNotReady {
        bundle: String,
        unknown: u64,
        collisions: u64,
        unassigned_extra: u64,
    },

    /// The page is quarantined as a collision and must be resolved first.
    #[error("page {image} collides at paper {paper} page {page}; resolve the collision first")]
    Collision { paper: u32, page: u32, image: String },

    /// The integrity token does not match the group's current page set.
    #[error("task {task}: integrity token {presented} is stale (current: {current:?})")]
    StaleIntegrity {
        task: String,
        presented: String,
        current: Option<String>,
    },

    /// Another user holds or finished the task.
    #[error("task {task} is already claimed (holder: {holder:?})")]
    AlreadyClaimed {
        task: String,
        holder: Option<String>,
    },

    /// The user has reached their task cap.
    #[error("user {user} has reached their quota of {limit} tasks")]
    QuotaExceeded { user: String, limit: u32 },

    /// Attempt to change the version map of a paper that has scanned pages.
    #[error("paper {paper} already has scanned pages; its version assignment is immutable")]
    PqvImmutable { paper: u32 },

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The task is not in a state that permits the action.
    #[error("task {task} is {status}; cannot {action}")]
    InvalidTransition {
        task: String,
        status: String,
        action: &'static str,
    },

    /// The task is leased to someone else.
    #[error("task {task} is not leased to {user}")]
    NotLeaseHolder { task: String, user: String },

    /// The caller's role does not allow the action.
    #[error("user {user} may not {action}")]
    PermissionDenied { user: String, action: &'static str },

    /// The rubric does not apply to this question/version.
    #[error("rubric {rid} is not usable for question {question} version {version}")]
    RubricOutOfScope {
        rid: String,
        question: u32,
        version: u32,
    },

    /// Two mutually exclusive rubrics were applied together.
    #[error("rubrics {rids:?} are exclusive within group {group:?}")]
    ExclusiveRubricConflict { group: String, rids: Vec<String> },

    /// The student id is already attached to another paper.
    #[error("student {student_id} already identifies paper {paper}")]
    StudentAlreadyIdentified { student_id: String, paper: u32 },

    /// A mark outside the question's range.
    #[error("score {score} is outside 0..={max}")]
    ScoreOutOfRange { score: f64, max: u32 },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ScanmarkError>;

impl ScanmarkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an invalid-code error.
    pub fn invalid_code(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCode {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error for the named entity.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the client should simply ask for another task.
    pub fn is_claim_race(&self) -> bool {
        matches!(self, Self::AlreadyClaimed { .. } | Self::QuotaExceeded { .. })
    }
}
