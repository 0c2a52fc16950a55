//! Stored group state and the transactional reconcile step.

use libsql::{Connection, Row, params};
use scanmark_shared::{
    AssessmentLayout, GroupKind, GroupRecord, PqvRow, Result, ScannedPage, ScanmarkError, TaskId,
};
use tracing::info;

use crate::Storage;
use crate::assessment::{pqv_row_on, require_layout_on};
use crate::bundles::attached_pages_on;
use crate::rows::{db_err, flag, int, json, next, now_text, opt_text, text, to_json};
use crate::tasks::{ensure_task_on, invalidate_worked_on};

/// Computes the desired groups of a paper from its attached pages.
///
/// Called inside the reconcile transaction, so it must not block.
pub trait GroupPlanner: Send + Sync {
    fn plan(
        &self,
        paper: u32,
        layout: &AssessmentLayout,
        row: &PqvRow,
        pages: &[ScannedPage],
    ) -> Vec<GroupRecord>;
}

/// How a group moved during a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupChange {
    Unchanged,
    /// Stored state changed without crossing the scanned boundary.
    Updated,
    BecameScanned,
    /// Still scanned, but the page set differs.
    ContentChanged,
    BecameUnscanned,
}

/// Per-group outcome of a reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDelta {
    pub kind: GroupKind,
    pub change: GroupChange,
    /// Out/Complete tasks moved to OutOfDate.
    pub invalidated: Vec<TaskId>,
    /// Fresh ToDo task, if one was created.
    pub created: Option<TaskId>,
}

fn row_to_group(row: &Row) -> Result<GroupRecord> {
    let label = text(row, 1)?;
    Ok(GroupRecord {
        paper: int(row, 0)?,
        kind: GroupKind::from_label(&label)
            .ok_or_else(|| ScanmarkError::Storage(format!("bad group label {label:?}")))?,
        version: int(row, 2)?,
        scanned: flag(row, 3)?,
        content_hash: opt_text(row, 4),
        pages: json(row, 5)?,
    })
}

pub(crate) async fn groups_on(conn: &Connection, paper: u32) -> Result<Vec<GroupRecord>> {
    let mut rows = conn
        .query(
            "SELECT paper_number, group_label, version, scanned, content_hash, pages_json
             FROM paper_groups WHERE paper_number = ?1",
            params![paper],
        )
        .await
        .map_err(db_err)?;
    let mut out = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        out.push(row_to_group(&row)?);
    }
    // Labels sort `q10` before `q2`.
    out.sort_by_key(|g| g.kind);
    Ok(out)
}

pub(crate) async fn group_on(
    conn: &Connection,
    paper: u32,
    kind: GroupKind,
) -> Result<Option<GroupRecord>> {
    let mut rows = conn
        .query(
            "SELECT paper_number, group_label, version, scanned, content_hash, pages_json
             FROM paper_groups WHERE paper_number = ?1 AND group_label = ?2",
            params![paper, kind.label()],
        )
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => Ok(Some(row_to_group(&row)?)),
        None => Ok(None),
    }
}

async fn upsert_group_on(conn: &Connection, group: &GroupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO paper_groups (paper_number, group_label, version, scanned, content_hash,
           pages_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(paper_number, group_label) DO UPDATE SET
           version = excluded.version,
           scanned = excluded.scanned,
           content_hash = excluded.content_hash,
           pages_json = excluded.pages_json,
           updated_at = excluded.updated_at",
        params![
            group.paper,
            group.kind.label(),
            group.version,
            i64::from(group.scanned),
            group.content_hash.as_deref(),
            to_json(&group.pages)?,
            now_text()
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

fn classify_change(stored: Option<&GroupRecord>, desired: &GroupRecord) -> GroupChange {
    let was_scanned = stored.is_some_and(|g| g.scanned);
    match (was_scanned, desired.scanned) {
        (false, true) => GroupChange::BecameScanned,
        (true, false) => GroupChange::BecameUnscanned,
        (true, true) if stored.and_then(|g| g.content_hash.as_ref()) != desired.content_hash.as_ref() => {
            GroupChange::ContentChanged
        }
        _ if stored != Some(desired) => GroupChange::Updated,
        _ => GroupChange::Unchanged,
    }
}

impl Storage {
    /// Recompute the groups of `paper` and apply the task consequences atomically.
    ///
    /// - A group that becomes scanned gets a ToDo task unless a live one exists.
    /// - A group whose page set changed, or that lost a page, has its
    ///   Out/Complete task moved to OutOfDate and a fresh ToDo created. A
    ///   ToDo on an unscanned group cannot be claimed until it is complete again.
    pub async fn reconcile_paper(
        &self,
        paper: u32,
        planner: &dyn GroupPlanner,
    ) -> Result<Vec<GroupDelta>> {
        let tx = self.begin_write().await?;
        let layout = require_layout_on(&tx).await?;
        let row = pqv_row_on(&tx, paper)
            .await?
            .ok_or_else(|| ScanmarkError::not_found("paper", paper))?;
        let pages = attached_pages_on(&tx, paper).await?;
        let stored = groups_on(&tx, paper).await?;

        let mut deltas = Vec::new();
        for desired in planner.plan(paper, &layout, &row, &pages) {
            let previous = stored.iter().find(|g| g.kind == desired.kind);
            let change = classify_change(previous, &desired);
            if change == GroupChange::Unchanged {
                continue;
            }
            upsert_group_on(&tx, &desired).await?;

            let mut delta = GroupDelta {
                kind: desired.kind,
                change,
                invalidated: Vec::new(),
                created: None,
            };
            if desired.kind.task_kind().is_some() {
                match change {
                    GroupChange::BecameScanned => {
                        delta.created = ensure_task_on(&tx, &desired).await?;
                    }
                    GroupChange::ContentChanged | GroupChange::BecameUnscanned => {
                        delta.invalidated = invalidate_worked_on(&tx, paper, desired.kind).await?;
                        delta.created = ensure_task_on(&tx, &desired).await?;
                    }
                    GroupChange::Updated | GroupChange::Unchanged => {}
                }
            }
            deltas.push(delta);
        }
        tx.commit().await?;

        for delta in &deltas {
            info!(
                paper,
                group = %delta.kind.label(),
                change = ?delta.change,
                invalidated = delta.invalidated.len(),
                created = delta.created.is_some(),
                "group reconciled"
            );
        }
        Ok(deltas)
    }

    /// Stored groups of a paper.
    pub async fn groups(&self, paper: u32) -> Result<Vec<GroupRecord>> {
        groups_on(self.conn(), paper).await
    }

    pub async fn group(&self, paper: u32, kind: GroupKind) -> Result<Option<GroupRecord>> {
        group_on(self.conn(), paper, kind).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::{provisioned, provisioned_at, test_db_path};
    use std::path::Path;
    use scanmark_shared::{BundleStatus, PageClassification, TaskStatus};

    /// One group per question, hashed by concatenating image hashes.
    pub(crate) struct QuestionPlanner;

    impl GroupPlanner for QuestionPlanner {
        fn plan(
            &self,
            paper: u32,
            layout: &AssessmentLayout,
            row: &PqvRow,
            pages: &[ScannedPage],
        ) -> Vec<GroupRecord> {
            (1..=layout.question_count())
                .map(|q| {
                    let expected = &layout.questions[q as usize - 1].pages;
                    let attached: Vec<&ScannedPage> = pages
                        .iter()
                        .filter(|p| match &p.classification {
                            PageClassification::Known { page, .. } => expected.contains(page),
                            PageClassification::Extra {
                                assignment: Some(a),
                            } => a.questions.contains(&q),
                            _ => false,
                        })
                        .collect();
                    let scanned = expected.iter().all(|e| {
                        attached.iter().any(|p| {
                            matches!(p.classification, PageClassification::Known { page, .. } if page == *e)
                        })
                    });
                    GroupRecord {
                        paper,
                        kind: GroupKind::Question(q),
                        version: row.version_of(q).unwrap_or(1),
                        scanned,
                        content_hash: (!attached.is_empty()).then(|| {
                            attached.iter().map(|p| p.image_hash.as_str()).collect::<Vec<_>>().join("+")
                        }),
                        pages: attached.iter().map(|p| p.id.clone()).collect(),
                    }
                })
                .collect()
        }
    }

    pub(crate) fn qr(paper: u32, page: u32) -> Vec<String> {
        use scanmark_codec::{Corner, PageCode, Tpv, encode};
        let code = PageCode::Paper(Tpv::new(paper, page, 1).unwrap());
        vec![encode(code, Corner::NorthEast, "93849").unwrap()]
    }

    /// Paper 1 fully scanned and pushed; Q1..Q3 have ToDo tasks.
    pub(crate) async fn scanned_paper() -> Storage {
        scanned_paper_at(&test_db_path()).await
    }

    pub(crate) async fn scanned_paper_at(path: &Path) -> Storage {
        let storage = provisioned_at(path, 2).await;
        let reg = storage.register_bundle("b1", "h1").await.unwrap();
        let b = reg.bundle().id.clone();
        for page in 1..=5 {
            storage
                .record_page(&b, page, &format!("p1-{page}"), &qr(1, page))
                .await
                .unwrap();
        }
        storage.set_bundle_status(&b, BundleStatus::Staged, None).await.unwrap();
        storage.push_bundle(&b).await.unwrap();
        storage.reconcile_paper(1, &QuestionPlanner).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn scanned_groups_get_tasks() {
        let storage = scanned_paper().await;
        let groups = storage.groups(1).await.unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.scanned));

        let tasks = storage.list_tasks(&Default::default()).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::ToDo));

        // Nothing moved, nothing happens.
        let deltas = storage.reconcile_paper(1, &QuestionPlanner).await.unwrap();
        assert!(deltas.is_empty());
    }

    #[tokio::test]
    async fn groups_list_by_kind_then_question() {
        let storage = provisioned(1).await;
        let tx = storage.begin_write().await.unwrap();
        for kind in [
            GroupKind::Question(10),
            GroupKind::Question(2),
            GroupKind::DoNotMark,
            GroupKind::Id,
        ] {
            let group = GroupRecord {
                paper: 1,
                kind,
                version: 1,
                scanned: false,
                content_hash: None,
                pages: Vec::new(),
            };
            upsert_group_on(&tx, &group).await.unwrap();
        }
        tx.commit().await.unwrap();

        let kinds: Vec<GroupKind> = storage.groups(1).await.unwrap().iter().map(|g| g.kind).collect();
        assert_eq!(
            kinds,
            vec![
                GroupKind::Id,
                GroupKind::DoNotMark,
                GroupKind::Question(2),
                GroupKind::Question(10)
            ]
        );
    }

    #[tokio::test]
    async fn unpushed_pages_do_not_count() {
        let storage = provisioned(2).await;
        let reg = storage.register_bundle("b1", "h1").await.unwrap();
        storage
            .record_page(&reg.bundle().id, 1, "x", &qr(2, 2))
            .await
            .unwrap();
        let deltas = storage.reconcile_paper(2, &QuestionPlanner).await.unwrap();
        assert!(deltas.iter().all(|d| d.created.is_none()));
        assert!(storage.list_tasks(&Default::default()).await.unwrap().is_empty());
    }

    #[test]
    fn change_classification() {
        let base = GroupRecord {
            paper: 1,
            kind: GroupKind::Question(1),
            version: 1,
            scanned: true,
            content_hash: Some("a".into()),
            pages: vec![],
        };
        assert_eq!(classify_change(None, &base), GroupChange::BecameScanned);
        assert_eq!(classify_change(Some(&base), &base), GroupChange::Unchanged);

        let changed = GroupRecord {
            content_hash: Some("b".into()),
            ..base.clone()
        };
        assert_eq!(classify_change(Some(&base), &changed), GroupChange::ContentChanged);

        let lost = GroupRecord {
            scanned: false,
            ..base.clone()
        };
        assert_eq!(classify_change(Some(&base), &lost), GroupChange::BecameUnscanned);
        assert_eq!(classify_change(None, &lost), GroupChange::Updated);
    }
}
