//! SQL migration definitions for the scanmark database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: assessment, papers, bundles, images, groups, tasks",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- The single loaded assessment layout
CREATE TABLE IF NOT EXISTS assessment (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    layout_json TEXT NOT NULL,
    loaded_at   TEXT NOT NULL
);

-- Provisioned papers and their version rows
CREATE TABLE IF NOT EXISTS papers (
    paper_number  INTEGER PRIMARY KEY,
    id_version    INTEGER,
    versions_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

-- Uploaded scan files
CREATE TABLE IF NOT EXISTS bundles (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    content_hash TEXT NOT NULL UNIQUE,
    status       TEXT NOT NULL,
    error        TEXT,
    created_at   TEXT NOT NULL,
    pushed_at    TEXT
);

-- Page images extracted from bundles
CREATE TABLE IF NOT EXISTS images (
    id             TEXT PRIMARY KEY,
    bundle_id      TEXT NOT NULL REFERENCES bundles(id) ON DELETE CASCADE,
    bundle_order   INTEGER NOT NULL,
    image_hash     TEXT NOT NULL,
    raw_codes_json TEXT NOT NULL,
    kind           TEXT NOT NULL,
    paper_number   INTEGER,
    page_number    INTEGER,
    version        INTEGER,
    questions_json TEXT,
    collides_with  TEXT,
    reason         TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE(bundle_id, bundle_order)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_images_known_slot
    ON images(paper_number, page_number) WHERE kind = 'known';
CREATE INDEX IF NOT EXISTS idx_images_paper ON images(paper_number);
CREATE INDEX IF NOT EXISTS idx_images_hash ON images(image_hash);

-- Assembled groups per paper
CREATE TABLE IF NOT EXISTS paper_groups (
    paper_number INTEGER NOT NULL,
    group_label  TEXT NOT NULL,
    version      INTEGER NOT NULL,
    scanned      INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT,
    pages_json   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (paper_number, group_label)
);

-- Identify and mark tasks
CREATE TABLE IF NOT EXISTS tasks (
    id                TEXT PRIMARY KEY,
    kind              TEXT NOT NULL,
    paper_number      INTEGER NOT NULL,
    group_label       TEXT NOT NULL,
    question          INTEGER,
    version           INTEGER NOT NULL,
    status            TEXT NOT NULL,
    assigned_user     TEXT,
    claimed_at        TEXT,
    integrity_token   TEXT,
    latest_annotation TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_group
    ON tasks(paper_number, group_label) WHERE status != 'out_of_date';
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(assigned_user);

CREATE TABLE IF NOT EXISTS task_tags (
    task_id    TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    tag        TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_task_tags_tag ON task_tags(tag);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Results: annotations, rubrics, identities, predictions, user policy",
            sql: r#"
-- One row per marking edition
CREATE TABLE IF NOT EXISTS annotations (
    id                TEXT PRIMARY KEY,
    task_id           TEXT NOT NULL REFERENCES tasks(id),
    paper_number      INTEGER NOT NULL,
    question          INTEGER NOT NULL,
    username          TEXT NOT NULL,
    edition           INTEGER NOT NULL,
    score             REAL NOT NULL,
    marking_time_secs REAL NOT NULL,
    integrity_token   TEXT NOT NULL,
    payload_json      TEXT NOT NULL,
    discarded         INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    UNIQUE(paper_number, question, edition)
);

-- Rubric revisions cited by an annotation, in order
CREATE TABLE IF NOT EXISTS annotation_rubrics (
    annotation_id TEXT NOT NULL REFERENCES annotations(id) ON DELETE CASCADE,
    position      INTEGER NOT NULL,
    rid           TEXT NOT NULL,
    revision      INTEGER NOT NULL,
    PRIMARY KEY (annotation_id, position)
);

CREATE INDEX IF NOT EXISTS idx_annotation_rubrics_rid ON annotation_rubrics(rid, revision);

-- Immutable rubric snapshots
CREATE TABLE IF NOT EXISTS rubrics (
    rid           TEXT NOT NULL,
    revision      INTEGER NOT NULL,
    subrevision   INTEGER NOT NULL,
    kind          TEXT NOT NULL,
    value         REAL NOT NULL,
    text          TEXT NOT NULL,
    question      INTEGER NOT NULL,
    versions_json TEXT NOT NULL,
    group_label   TEXT,
    exclusive     INTEGER NOT NULL DEFAULT 0,
    author        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (rid, revision, subrevision)
);

CREATE INDEX IF NOT EXISTS idx_rubrics_question ON rubrics(question);

CREATE TABLE IF NOT EXISTS paper_identities (
    paper_number INTEGER PRIMARY KEY,
    student_id   TEXT NOT NULL UNIQUE,
    student_name TEXT NOT NULL,
    username     TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS id_predictions (
    paper_number INTEGER NOT NULL,
    predictor    TEXT NOT NULL,
    student_id   TEXT NOT NULL,
    certainty    REAL NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (paper_number, predictor)
);

CREATE TABLE IF NOT EXISTS user_quotas (
    username TEXT PRIMARY KEY,
    max_tasks INTEGER NOT NULL
);

-- version 0 permits every version of the question
CREATE TABLE IF NOT EXISTS user_permissions (
    username TEXT NOT NULL,
    question INTEGER NOT NULL,
    version  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (username, question, version)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Papers remember their first scan",
            sql: r#"
-- Set when any image first attaches to the paper; never cleared
ALTER TABLE papers ADD COLUMN first_scanned_at TEXT;

UPDATE papers SET first_scanned_at = (
    SELECT MIN(i.created_at) FROM images i WHERE i.paper_number = papers.paper_number
)
WHERE EXISTS (SELECT 1 FROM images i WHERE i.paper_number = papers.paper_number);

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
