//! Rubric ledger: validated creation and revision of rubrics.

use chrono::Utc;
use tracing::{info, instrument};

use scanmark_shared::{
    AssessmentLayout, Caller, Result, Rubric, RubricDraft, RubricId, RubricKind, RubricPatch,
    ScanmarkError, TaskPolicyConfig,
};
use scanmark_storage::{MajorRevision, Storage};

use crate::access::{require_manager, require_worker};

/// Check a rubric snapshot against the assessment layout.
fn validate(layout: &AssessmentLayout, rubric: &Rubric) -> Result<()> {
    let question = layout
        .question(rubric.question)
        .ok_or_else(|| ScanmarkError::not_found("question", rubric.question))?;
    if let Some(v) = rubric
        .versions
        .iter()
        .find(|&&v| v == 0 || v > layout.num_versions)
    {
        return Err(ScanmarkError::validation(format!(
            "rubric version {v} is outside 1..={}",
            layout.num_versions
        )));
    }
    let max = f64::from(question.mark);
    let ok = match rubric.kind {
        RubricKind::Neutral => rubric.value == 0.0,
        RubricKind::Absolute => (0.0..=max).contains(&rubric.value),
        RubricKind::Relative => rubric.value.abs() <= max,
    };
    if !ok {
        return Err(ScanmarkError::validation(format!(
            "{} rubric value {} does not fit question {} (mark {})",
            rubric.kind, rubric.value, rubric.question, question.mark
        )));
    }
    if rubric.exclusive && rubric.group.is_none() {
        return Err(ScanmarkError::validation("exclusive rubrics need a group"));
    }
    if rubric.text.trim().is_empty() {
        return Err(ScanmarkError::validation("rubric text is empty"));
    }
    Ok(())
}

/// Creates and revises rubrics on behalf of callers.
pub struct RubricLedger<'a> {
    storage: &'a Storage,
    policy: TaskPolicyConfig,
}

impl<'a> RubricLedger<'a> {
    pub fn new(storage: &'a Storage, policy: TaskPolicyConfig) -> Self {
        Self { storage, policy }
    }

    async fn latest(&self, rid: &RubricId) -> Result<Rubric> {
        self.storage
            .latest_rubric(rid)
            .await?
            .ok_or_else(|| ScanmarkError::not_found("rubric", rid))
    }

    /// Store a new rubric at revision 1.0.
    #[instrument(skip(self, caller, draft), fields(user = %caller.username, question = draft.question))]
    pub async fn create(&self, caller: &Caller, draft: RubricDraft) -> Result<Rubric> {
        require_worker(caller, "create rubrics")?;
        let rubric = Rubric {
            rid: RubricId::new(),
            revision: 1,
            subrevision: 0,
            kind: draft.kind,
            value: draft.value,
            text: draft.text,
            question: draft.question,
            versions: draft.versions,
            group: draft.group,
            exclusive: draft.exclusive,
            author: caller.username.clone(),
            created_at: Utc::now(),
        };
        validate(&self.storage.require_layout().await?, &rubric)?;
        self.storage.insert_rubric(&rubric).await?;
        Ok(rubric)
    }

    /// Cosmetic edit: same revision, next subrevision. Existing results
    /// are unaffected, so only the text may change.
    pub async fn revise_minor(
        &self,
        caller: &Caller,
        rid: &RubricId,
        patch: &RubricPatch,
    ) -> Result<Rubric> {
        require_worker(caller, "edit rubrics")?;
        if !patch.is_text_only() {
            return Err(ScanmarkError::validation(format!(
                "rubric {rid}: a minor revision may only change the text; \
                 value, kind, scope and grouping need a major revision"
            )));
        }
        let latest = self.latest(rid).await?;
        let rubric = Rubric {
            subrevision: latest.subrevision + 1,
            author: caller.username.clone(),
            created_at: Utc::now(),
            ..patch.apply(&latest)
        };
        validate(&self.storage.require_layout().await?, &rubric)?;
        self.storage.insert_rubric(&rubric).await?;
        Ok(rubric)
    }

    /// Semantic edit: next revision. Completed results citing an older
    /// revision are tagged for review and keep their status.
    #[instrument(skip(self, caller, patch), fields(user = %caller.username, rid = %rid))]
    pub async fn revise_major(
        &self,
        caller: &Caller,
        rid: &RubricId,
        patch: &RubricPatch,
    ) -> Result<MajorRevision> {
        require_manager(caller, "revise rubrics")?;
        let latest = self.latest(rid).await?;
        let rubric = Rubric {
            revision: latest.revision + 1,
            subrevision: 0,
            author: caller.username.clone(),
            created_at: Utc::now(),
            ..patch.apply(&latest)
        };
        validate(&self.storage.require_layout().await?, &rubric)?;
        let outcome = self
            .storage
            .revise_major(&rubric, &self.policy.review_tag)
            .await?;
        info!(revision = rubric.revision, tagged = outcome.tagged.len(), "major revision stored");
        Ok(outcome)
    }

    /// The revision a marker should cite for `question` at `version`.
    pub async fn resolve_for_use(
        &self,
        rid: &RubricId,
        question: u32,
        version: u32,
    ) -> Result<Rubric> {
        let latest = self.latest(rid).await?;
        if !latest.admits(question, version) {
            return Err(ScanmarkError::RubricOutOfScope {
                rid: rid.to_string(),
                question,
                version,
            });
        }
        Ok(latest)
    }

    pub async fn list(&self, question: Option<u32>) -> Result<Vec<Rubric>> {
        self.storage.list_rubrics(question).await
    }

    pub async fn history(&self, rid: &RubricId) -> Result<Vec<Rubric>> {
        self.storage.rubric_history(rid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskEngine;
    use crate::testing::{manager, marker, scanned_papers, small_storage};
    use assert_matches::assert_matches;
    use scanmark_shared::{MarkSubmission, TaskFilter, TaskKind, TaskStatus};

    fn draft(kind: RubricKind, value: f64) -> RubricDraft {
        RubricDraft {
            kind,
            value,
            text: "sign error".into(),
            question: 1,
            versions: vec![],
            group: None,
            exclusive: false,
        }
    }

    #[tokio::test]
    async fn values_are_checked_against_the_question() {
        let storage = small_storage(1).await;
        let ledger = RubricLedger::new(&storage, TaskPolicyConfig::default());
        let ann = marker("ann");

        ledger.create(&ann, draft(RubricKind::Absolute, 5.0)).await.unwrap();
        ledger.create(&ann, draft(RubricKind::Neutral, 0.0)).await.unwrap();
        for bad in [
            draft(RubricKind::Absolute, 6.0),
            draft(RubricKind::Relative, -5.5),
            draft(RubricKind::Neutral, 1.0),
            RubricDraft { versions: vec![3], ..draft(RubricKind::Relative, 1.0) },
            RubricDraft { exclusive: true, ..draft(RubricKind::Relative, 1.0) },
        ] {
            assert_matches!(
                ledger.create(&ann, bad).await,
                Err(ScanmarkError::Validation { .. })
            );
        }
        assert_matches!(
            ledger
                .create(&ann, RubricDraft { question: 9, ..draft(RubricKind::Relative, 1.0) })
                .await,
            Err(ScanmarkError::NotFound { entity: "question", .. })
        );
    }

    #[tokio::test]
    async fn minor_revisions_keep_the_revision() {
        let storage = small_storage(1).await;
        let ledger = RubricLedger::new(&storage, TaskPolicyConfig::default());
        let ann = marker("ann");
        let rubric = ledger.create(&ann, draft(RubricKind::Relative, -1.0)).await.unwrap();

        let patch = RubricPatch {
            text: Some("sign error in line 2".into()),
            ..Default::default()
        };
        let edited = ledger.revise_minor(&ann, &rubric.rid, &patch).await.unwrap();
        assert_eq!((edited.revision, edited.subrevision), (1, 1));
        assert_eq!(edited.value, -1.0);

        let history = ledger.history(&rubric.rid).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "sign error");
        let listed = ledger.list(Some(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subrevision, 1);

        assert_matches!(
            ledger.revise_major(&ann, &rubric.rid, &patch).await,
            Err(ScanmarkError::PermissionDenied { .. })
        );
    }

    #[tokio::test]
    async fn minor_revisions_cannot_change_meaning() {
        let storage = small_storage(1).await;
        let ledger = RubricLedger::new(&storage, TaskPolicyConfig::default());
        let ann = marker("ann");
        let rubric = ledger.create(&ann, draft(RubricKind::Relative, -1.0)).await.unwrap();

        let changes = [
            RubricPatch {
                value: Some(-2.0),
                ..Default::default()
            },
            RubricPatch {
                kind: Some(RubricKind::Neutral),
                value: Some(0.0),
                ..Default::default()
            },
            RubricPatch {
                versions: Some(vec![2]),
                ..Default::default()
            },
            RubricPatch {
                group: Some("arith".into()),
                exclusive: Some(true),
                text: Some("slip".into()),
                ..Default::default()
            },
        ];
        for patch in &changes {
            assert_matches!(
                ledger.revise_minor(&ann, &rubric.rid, patch).await,
                Err(ScanmarkError::Validation { .. })
            );
        }
        assert_eq!(ledger.history(&rubric.rid).await.unwrap().len(), 1);

        let revised = ledger
            .revise_major(
                &manager(),
                &rubric.rid,
                &RubricPatch {
                    value: Some(-2.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(revised.rubric.revision, 2);
    }

    #[tokio::test]
    async fn major_revision_flags_earlier_marks() {
        let storage = small_storage(4).await;
        scanned_papers(&storage, "b1", &[1, 2, 3, 4]).await;
        let policy = TaskPolicyConfig::default();
        let engine = TaskEngine::new(&storage, policy.clone());
        let ledger = RubricLedger::new(&storage, policy.clone());
        let ann = marker("ann");

        let rubric = ledger.create(&ann, draft(RubricKind::Relative, -1.0)).await.unwrap();
        let q1 = TaskFilter {
            question: Some(1),
            ..Default::default()
        };
        let tasks = storage.list_tasks(&q1).await.unwrap();
        assert_eq!(tasks.len(), 4);
        for task in &tasks[..3] {
            let lease = engine.claim(&ann, &task.id).await.unwrap();
            engine
                .complete_mark(
                    &ann,
                    &task.id,
                    &lease.integrity_token,
                    &MarkSubmission {
                        score: 4.0,
                        marking_time_secs: 20.0,
                        rubrics: vec![rubric.reference()],
                        payload: serde_json::json!({}),
                    },
                )
                .await
                .unwrap();
        }

        let patch = RubricPatch {
            value: Some(-2.0),
            ..Default::default()
        };
        let outcome = ledger.revise_major(&manager(), &rubric.rid, &patch).await.unwrap();
        assert_eq!(outcome.rubric.revision, 2);
        assert_eq!(outcome.tagged.len(), 3);

        for task in &tasks[..3] {
            let task = storage.task(&task.id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Complete);
            assert!(task.tags.contains(&policy.review_tag));
        }

        let fourth = storage.task(&tasks[3].id).await.unwrap();
        assert_eq!(fourth.status, TaskStatus::ToDo);
        let current = ledger.resolve_for_use(&rubric.rid, 1, fourth.version).await.unwrap();
        assert_eq!((current.revision, current.value), (2, -2.0));
        assert_matches!(
            ledger.resolve_for_use(&rubric.rid, 2, 1).await,
            Err(ScanmarkError::RubricOutOfScope { question: 2, .. })
        );

        // Citing the superseded revision is accepted but flagged.
        let lease = engine.claim(&ann, &fourth.id).await.unwrap();
        engine
            .complete_mark(
                &ann,
                &fourth.id,
                &lease.integrity_token,
                &MarkSubmission {
                    score: 4.0,
                    marking_time_secs: 9.0,
                    rubrics: vec![rubric.reference()],
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        let tagged = engine
            .list(&TaskFilter {
                kind: Some(TaskKind::Mark),
                tag: Some(policy.review_tag.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tagged.len(), 4);
    }
}
