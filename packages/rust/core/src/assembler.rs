//! Paper assembler.
//!
//! Works out, per paper, which attached pages belong to which group and
//! whether every expected page is present. The group's content hash
//! doubles as the integrity token handed out with task leases.

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use scanmark_shared::{
    AssessmentLayout, GroupKind, GroupRecord, PageClassification, PqvRow, Result, ScannedPage,
};
use scanmark_storage::{GroupDelta, GroupPlanner, Storage};

/// The production [`GroupPlanner`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PaperAssembler;

/// Expected pages of every group the layout defines, in group order.
fn expected_groups(layout: &AssessmentLayout) -> Vec<(GroupKind, Vec<u32>)> {
    let mut groups = Vec::new();
    if let Some(page) = layout.id_page {
        groups.push((GroupKind::Id, vec![page]));
    }
    if !layout.do_not_mark_pages.is_empty() {
        groups.push((GroupKind::DoNotMark, layout.do_not_mark_pages.clone()));
    }
    for (idx, question) in layout.questions.iter().enumerate() {
        groups.push((GroupKind::Question(idx as u32 + 1), question.pages.clone()));
    }
    groups
}

/// SHA-256 over the ordered `(image id, image hash)` pairs.
pub fn content_hash(pages: &[&ScannedPage]) -> String {
    let mut hasher = Sha256::new();
    for page in pages {
        hasher.update(page.id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(page.image_hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn plan_group(
    paper: u32,
    kind: GroupKind,
    expected: &[u32],
    row: &PqvRow,
    pages: &[ScannedPage],
) -> GroupRecord {
    let mut known: Vec<(u32, &ScannedPage)> = pages
        .iter()
        .filter_map(|p| match p.classification {
            PageClassification::Known { page, .. } if expected.contains(&page) => Some((page, p)),
            _ => None,
        })
        .collect();
    known.sort_by_key(|(page, _)| *page);

    let extras = pages.iter().filter(|p| match (&p.classification, kind) {
        (
            PageClassification::Extra {
                assignment: Some(a),
            },
            GroupKind::Question(q),
        ) => a.questions.contains(&q),
        _ => false,
    });

    let scanned = expected
        .iter()
        .all(|page| known.iter().any(|(p, _)| p == page));
    let attached: Vec<&ScannedPage> = known.iter().map(|(_, p)| *p).chain(extras).collect();

    let version = match kind {
        GroupKind::Question(q) => row.version_of(q).unwrap_or(1),
        GroupKind::Id | GroupKind::DoNotMark => row.id_version.unwrap_or(1),
    };

    GroupRecord {
        paper,
        kind,
        version,
        scanned,
        content_hash: (!attached.is_empty()).then(|| content_hash(&attached)),
        pages: attached.iter().map(|p| p.id.clone()).collect(),
    }
}

impl GroupPlanner for PaperAssembler {
    fn plan(
        &self,
        paper: u32,
        layout: &AssessmentLayout,
        row: &PqvRow,
        pages: &[ScannedPage],
    ) -> Vec<GroupRecord> {
        expected_groups(layout)
            .into_iter()
            .map(|(kind, expected)| plan_group(paper, kind, &expected, row, pages))
            .collect()
    }
}

/// Recompute one paper's groups and apply the task consequences.
#[instrument(skip(storage))]
pub async fn reconcile(storage: &Storage, paper: u32) -> Result<Vec<GroupDelta>> {
    let deltas = storage.reconcile_paper(paper, &PaperAssembler).await?;
    debug!(paper, changed = deltas.len(), "paper reconciled");
    Ok(deltas)
}

/// Reconcile each paper in turn.
pub async fn reconcile_all(storage: &Storage, papers: &[u32]) -> Result<Vec<GroupDelta>> {
    let mut deltas = Vec::new();
    for &paper in papers {
        deltas.extend(reconcile(storage, paper).await?);
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{push_all, qr, staged_bundle, storage_with};
    use scanmark_shared::{
        BundleId, ExtraAssignment, ImageId, PqvTable, TaskFilter, TaskKind, TaskStatus,
    };
    use scanmark_storage::GroupChange;

    /// Five pages mapped `[1], [2], [], [2, 3], [3]`.
    const PAPER_61: &str = r#"
name = "p61"
public_code = "93849"
num_pages = 5
num_versions = 2

[[questions]]
label = "Q1"
pages = [1]
mark = 4

[[questions]]
label = "Q2"
pages = [2, 4]
mark = 6

[[questions]]
label = "Q3"
pages = [4, 5]
mark = 6
"#;

    fn page(kind: PageClassification, hash: &str) -> ScannedPage {
        ScannedPage {
            id: ImageId::new(),
            bundle_id: BundleId::new(),
            bundle_order: 1,
            image_hash: hash.into(),
            classification: kind,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn garbage_page_joins_no_group() {
        let layout = AssessmentLayout::from_toml_str(PAPER_61).unwrap();
        let row = PqvRow::new(vec![1, 2, 2]);
        let pages: Vec<ScannedPage> = (1..=5)
            .map(|p| {
                page(
                    PageClassification::Known {
                        paper: 61,
                        page: p,
                        version: 1,
                    },
                    &format!("h{p}"),
                )
            })
            .collect();

        let groups = PaperAssembler.plan(61, &layout, &row, &pages);
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.scanned));
        let garbage = &pages[2].id;
        assert!(groups.iter().all(|g| !g.pages.contains(garbage)));
        assert_eq!(groups[1].pages, vec![pages[1].id.clone(), pages[3].id.clone()]);
        assert_eq!(groups[2].version, 2);
    }

    #[test]
    fn extra_pages_change_the_hash_only() {
        let layout = AssessmentLayout::from_toml_str(PAPER_61).unwrap();
        let row = PqvRow::new(vec![1, 1, 1]);
        let known = page(
            PageClassification::Known {
                paper: 61,
                page: 1,
                version: 1,
            },
            "a",
        );
        let before = PaperAssembler.plan(61, &layout, &row, std::slice::from_ref(&known));
        let extra = page(
            PageClassification::Extra {
                assignment: Some(ExtraAssignment {
                    paper: 61,
                    questions: vec![1],
                }),
            },
            "b",
        );
        let after = PaperAssembler.plan(61, &layout, &row, &[known, extra]);
        assert!(before[0].scanned && after[0].scanned);
        assert_ne!(before[0].content_hash, after[0].content_hash);
        assert!(!after[1].scanned);
        assert!(after[1].content_hash.is_none());
    }

    #[tokio::test]
    async fn scanned_questions_get_one_task_each() {
        let layout = AssessmentLayout::from_toml_str(PAPER_61).unwrap();
        let table: PqvTable = [(61, PqvRow::new(vec![1, 2, 2]))].into_iter().collect();
        let storage = storage_with(&layout, &table).await;

        let pages: Vec<(String, Vec<String>)> = (1..=5)
            .map(|p| {
                let version = if p == 1 || p == 3 { 1 } else { 2 };
                (format!("img-{p}"), qr(61, p, version))
            })
            .collect();
        let bundle = staged_bundle(&storage, "b61", &pages).await;
        let deltas = push_all(&storage, &bundle).await;

        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|d| d.change == GroupChange::BecameScanned));

        let tasks = storage
            .list_tasks(&TaskFilter {
                paper: Some(61),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks
            .iter()
            .all(|t| t.kind == TaskKind::Mark && t.status == TaskStatus::ToDo));
        let questions: Vec<_> = tasks.iter().filter_map(|t| t.question()).collect();
        assert_eq!(questions, vec![1, 2, 3]);

        // A second reconcile is a no-op.
        assert!(reconcile(&storage, 61).await.unwrap().is_empty());
    }
}
