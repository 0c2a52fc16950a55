//! Core domain types for scanmark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScanmarkError;

/// Prefix of the reserved tag that flags a task to a particular user.
pub const USER_TAG_PREFIX: char = '@';

/// The reserved tag flagging a task to `username`.
pub fn user_tag(username: &str) -> String {
    format!("{USER_TAG_PREFIX}{username}")
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// An uploaded scan bundle.
    BundleId
);
uuid_id!(
    /// One scanned page image.
    ImageId
);
uuid_id!(
    /// An identify or mark task.
    TaskId
);
uuid_id!(
    /// One annotation edition.
    AnnotationId
);
uuid_id!(
    /// A rubric across all its revisions.
    RubricId
);

/// Stored-as-text enums: `as_str`, `Display` and `FromStr`.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ScanmarkError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ScanmarkError::parse(format!(
                        concat!("unknown ", stringify!($name), " {:?}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Bundles and pages
// ---------------------------------------------------------------------------

/// Lifecycle of an uploaded bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Processing,
    Staged,
    Pushed,
    Failed,
}

text_enum!(BundleStatus {
    Processing => "processing",
    Staged => "staged",
    Pushed => "pushed",
    Failed => "failed",
});

/// An uploaded scan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub name: String,
    /// SHA-256 of the uploaded file.
    pub content_hash: String,
    pub status: BundleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Per-kind page counts for a bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub bundle: Bundle,
    pub total: u64,
    pub known: u64,
    pub extra: u64,
    pub unknown: u64,
    pub collisions: u64,
    pub discarded: u64,
    /// Extra pages not yet attached to a paper.
    pub unassigned_extra: u64,
}

impl BundleSummary {
    /// Whether nothing in the bundle awaits manual disposition.
    pub fn is_ready_to_push(&self) -> bool {
        self.unknown == 0 && self.collisions == 0 && self.unassigned_extra == 0
    }
}

/// Paper and questions an extra page belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraAssignment {
    pub paper: u32,
    pub questions: Vec<u32>,
}

/// The five page kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Known,
    Extra,
    Unknown,
    Collision,
    Discarded,
}

text_enum!(PageKind {
    Known => "known",
    Extra => "extra",
    Unknown => "unknown",
    Collision => "collision",
    Discarded => "discarded",
});

/// Where a scanned image ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageClassification {
    /// Decoded, validated and holding its `(paper, page)` slot.
    Known { paper: u32, page: u32, version: u32 },
    /// Supplementary page, attached by hand.
    Extra { assignment: Option<ExtraAssignment> },
    /// No usable code.
    Unknown { reason: String },
    /// Slot already held by a different image.
    Collision {
        paper: u32,
        page: u32,
        version: u32,
        existing: ImageId,
    },
    /// Out of consideration, kept for audit.
    Discarded { reason: String },
}

impl PageClassification {
    pub fn kind(&self) -> PageKind {
        match self {
            Self::Known { .. } => PageKind::Known,
            Self::Extra { .. } => PageKind::Extra,
            Self::Unknown { .. } => PageKind::Unknown,
            Self::Collision { .. } => PageKind::Collision,
            Self::Discarded { .. } => PageKind::Discarded,
        }
    }

    /// Paper this page contributes to, if any.
    pub fn paper(&self) -> Option<u32> {
        match self {
            Self::Known { paper, .. } | Self::Collision { paper, .. } => Some(*paper),
            Self::Extra {
                assignment: Some(a),
            } => Some(a.paper),
            _ => None,
        }
    }

    /// Whether an operator must act before the bundle can be pushed.
    pub fn needs_review(&self) -> bool {
        matches!(
            self,
            Self::Unknown { .. } | Self::Collision { .. } | Self::Extra { assignment: None }
        )
    }
}

/// One page image extracted from a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedPage {
    pub id: ImageId,
    pub bundle_id: BundleId,
    /// Position within the bundle, from 1.
    pub bundle_order: u32,
    /// SHA-256 of the image bytes.
    pub image_hash: String,
    pub classification: PageClassification,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// The kinds of group inside a paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Id,
    DoNotMark,
    Question(u32),
}

impl GroupKind {
    /// Stable storage label: `id`, `dnm`, `q<n>`.
    pub fn label(&self) -> String {
        match self {
            Self::Id => "id".into(),
            Self::DoNotMark => "dnm".into(),
            Self::Question(q) => format!("q{q}"),
        }
    }

    /// Inverse of [`GroupKind::label`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "id" => Some(Self::Id),
            "dnm" => Some(Self::DoNotMark),
            other => other
                .strip_prefix('q')
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .map(Self::Question),
        }
    }

    /// Task kind that works on this group, if any.
    pub fn task_kind(&self) -> Option<TaskKind> {
        match self {
            Self::Id => Some(TaskKind::Identify),
            Self::Question(_) => Some(TaskKind::Mark),
            Self::DoNotMark => None,
        }
    }

    pub fn question(&self) -> Option<u32> {
        match self {
            Self::Question(q) => Some(*q),
            _ => None,
        }
    }
}

/// Stored state of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub paper: u32,
    pub kind: GroupKind,
    pub version: u32,
    /// All expected pages are attached.
    pub scanned: bool,
    /// Hash of the attached page set; the integrity token for tasks.
    pub content_hash: Option<String>,
    /// Attached pages in group order.
    pub pages: Vec<ImageId>,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Identify,
    Mark,
}

text_enum!(TaskKind {
    Identify => "identify",
    Mark => "mark",
});

/// Task lifecycle: `ToDo → Out → Complete`, with `OutOfDate` as a terminal side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    ToDo,
    Out,
    Complete,
    OutOfDate,
}

text_enum!(TaskStatus {
    ToDo => "todo",
    Out => "out",
    Complete => "complete",
    OutOfDate => "out_of_date",
});

impl TaskStatus {
    /// Everything except `OutOfDate`.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::OutOfDate)
    }
}

/// A unit of identify-or-mark work over one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub paper: u32,
    pub group: GroupKind,
    pub version: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_token: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn question(&self) -> Option<u32> {
        self.group.question()
    }
}

/// Proof of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task: TaskId,
    pub user: String,
    /// Must be presented again on completion.
    pub integrity_token: String,
    pub claimed_at: DateTime<Utc>,
}

/// Filters for listing tasks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
    pub paper: Option<u32>,
    pub question: Option<u32>,
    pub version: Option<u32>,
    pub user: Option<String>,
    pub tag: Option<String>,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Scanner,
    Marker,
    Manager,
}

text_enum!(Role {
    Scanner => "scanner",
    Marker => "marker",
    Manager => "manager",
});

/// An authenticated identity presented with each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
    pub role: Role,
}

impl Caller {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            role,
        }
    }
}

/// One entry of a user's permitted (question, version) set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub question: u32,
    /// `None` permits every version.
    pub version: Option<u32>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A rubric revision cited by an annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RubricRef {
    pub rid: RubricId,
    pub revision: u32,
}

/// What a marker submits when completing a mark task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkSubmission {
    pub score: f64,
    pub marking_time_secs: f64,
    #[serde(default)]
    pub rubrics: Vec<RubricRef>,
    /// Opaque annotation data from the client.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One edition of marking for a (paper, question).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub task: TaskId,
    pub paper: u32,
    pub question: u32,
    pub username: String,
    pub edition: u32,
    pub score: f64,
    pub marking_time_secs: f64,
    /// Token held when the task was claimed.
    pub integrity_token: String,
    pub rubrics: Vec<RubricRef>,
    pub payload: serde_json::Value,
    /// Set once the task is reset; kept for history.
    pub discarded: bool,
    pub created_at: DateTime<Utc>,
}

/// The student attached to a paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperIdentity {
    pub paper: u32,
    pub student_id: String,
    pub student_name: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Advisory output of an external ID predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdPrediction {
    pub paper: u32,
    pub predictor: String,
    pub student_id: String,
    pub certainty: f64,
    pub created_at: DateTime<Utc>,
}

/// Derived progress of a paper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PaperStatus {
    pub paper: u32,
    /// No page ever attached.
    pub unused: bool,
    pub scanned: bool,
    pub identified: bool,
    pub marked: bool,
}

// ---------------------------------------------------------------------------
// Rubrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricKind {
    Neutral,
    Relative,
    Absolute,
}

text_enum!(RubricKind {
    Neutral => "neutral",
    Relative => "relative",
    Absolute => "absolute",
});

/// An immutable rubric snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub rid: RubricId,
    pub revision: u32,
    pub subrevision: u32,
    pub kind: RubricKind,
    pub value: f64,
    pub text: String,
    pub question: u32,
    /// Empty means every version.
    pub versions: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Mutually exclusive with other exclusive rubrics of the same group.
    pub exclusive: bool,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

impl Rubric {
    /// Whether the rubric may be used on `question` at `version`.
    pub fn admits(&self, question: u32, version: u32) -> bool {
        self.question == question && (self.versions.is_empty() || self.versions.contains(&version))
    }

    pub fn reference(&self) -> RubricRef {
        RubricRef {
            rid: self.rid.clone(),
            revision: self.revision,
        }
    }
}

/// Fields of a new rubric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricDraft {
    pub kind: RubricKind,
    pub value: f64,
    pub text: String,
    pub question: u32,
    #[serde(default)]
    pub versions: Vec<u32>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
}

/// Changes to apply to a rubric. Unset fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RubricPatch {
    pub kind: Option<RubricKind>,
    pub value: Option<f64>,
    pub text: Option<String>,
    pub versions: Option<Vec<u32>>,
    pub group: Option<String>,
    pub exclusive: Option<bool>,
}

impl RubricPatch {
    /// Only the wording changes; the rubric scores and applies as before.
    pub fn is_text_only(&self) -> bool {
        self.kind.is_none()
            && self.value.is_none()
            && self.versions.is_none()
            && self.group.is_none()
            && self.exclusive.is_none()
    }

    /// `base` with the patch applied; revision numbers are left to the caller.
    pub fn apply(&self, base: &Rubric) -> Rubric {
        Rubric {
            kind: self.kind.unwrap_or(base.kind),
            value: self.value.unwrap_or(base.value),
            text: self.text.clone().unwrap_or_else(|| base.text.clone()),
            versions: self.versions.clone().unwrap_or_else(|| base.versions.clone()),
            group: self.group.clone().or_else(|| base.group.clone()),
            exclusive: self.exclusive.unwrap_or(base.exclusive),
            ..base.clone()
        }
    }
}
