//! Page review and bundle push.
//!
//! Every action here settles page classifications and then reassembles the
//! papers it touched, so group and task state never lag behind the pages.

use tracing::{info, instrument};

use scanmark_shared::{BundleId, Caller, ImageId, Result, ScannedPage};
use scanmark_storage::{CollisionKeep, Disposition, GroupDelta, PageAction, Storage};

use crate::access::require_manager;
use crate::assembler::reconcile_all;

/// Result of a push or a page action.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    /// The page after the action, for page actions.
    pub page: Option<ScannedPage>,
    /// Papers that were reassembled.
    pub papers: Vec<u32>,
    pub deltas: Vec<GroupDelta>,
}

async fn settle(storage: &Storage, action: PageAction) -> Result<ReviewOutcome> {
    let deltas = reconcile_all(storage, &action.papers).await?;
    Ok(ReviewOutcome {
        page: Some(action.page),
        papers: action.papers,
        deltas,
    })
}

/// Push a staged bundle and assemble every paper it feeds.
#[instrument(skip(storage, caller), fields(user = %caller.username))]
pub async fn push(storage: &Storage, caller: &Caller, bundle: &BundleId) -> Result<ReviewOutcome> {
    require_manager(caller, "push bundles")?;
    let papers = storage.push_bundle(bundle).await?;
    let deltas = reconcile_all(storage, &papers).await?;
    let created = deltas.iter().filter(|d| d.created.is_some()).count();
    info!(papers = papers.len(), tasks_created = created, "push assembled");
    Ok(ReviewOutcome {
        page: None,
        papers,
        deltas,
    })
}

#[instrument(skip(storage, caller), fields(user = %caller.username))]
pub async fn discard_page(
    storage: &Storage,
    caller: &Caller,
    image: &ImageId,
    reason: &str,
) -> Result<ReviewOutcome> {
    require_manager(caller, "discard pages")?;
    let action = storage.discard_page(image, reason).await?;
    settle(storage, action).await
}

#[instrument(skip(storage, caller), fields(user = %caller.username))]
pub async fn resolve_collision(
    storage: &Storage,
    caller: &Caller,
    image: &ImageId,
    keep: CollisionKeep,
) -> Result<ReviewOutcome> {
    require_manager(caller, "resolve collisions")?;
    let action = storage.resolve_collision(image, keep).await?;
    settle(storage, action).await
}

#[instrument(skip(storage, caller), fields(user = %caller.username))]
pub async fn dispose_unknown(
    storage: &Storage,
    caller: &Caller,
    image: &ImageId,
    disposition: Disposition,
) -> Result<ReviewOutcome> {
    require_manager(caller, "classify pages")?;
    let action = storage.dispose_unknown(image, disposition).await?;
    settle(storage, action).await
}

#[instrument(skip(storage, caller), fields(user = %caller.username))]
pub async fn assign_extra(
    storage: &Storage,
    caller: &Caller,
    image: &ImageId,
    paper: u32,
    questions: Vec<u32>,
) -> Result<ReviewOutcome> {
    require_manager(caller, "assign extra pages")?;
    let action = storage.assign_extra(image, paper, questions).await?;
    settle(storage, action).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{manager, push_all, qr, scanned_papers, small_storage, staged_bundle};
    use assert_matches::assert_matches;
    use scanmark_shared::{
        Caller, GroupKind, MarkSubmission, PageClassification, PageKind, Role, ScanmarkError,
        TaskFilter, TaskStatus,
    };
    use scanmark_storage::GroupChange;

    #[tokio::test]
    async fn collision_keeps_exactly_one_known() {
        let storage = small_storage(30).await;
        let bundle = staged_bundle(
            &storage,
            "b1",
            &[
                ("first".into(), qr(20, 3, 1)),
                ("second".into(), qr(20, 3, 1)),
            ],
        )
        .await;
        let pages = storage.bundle_pages(&bundle).await.unwrap();
        assert_eq!(pages[0].classification.kind(), PageKind::Known);
        assert_matches!(
            &pages[1].classification,
            PageClassification::Collision { paper: 20, page: 3, existing, .. } if *existing == pages[0].id
        );

        assert_matches!(
            push(&storage, &manager(), &bundle).await,
            Err(ScanmarkError::BundleNotReady { collisions: 1, .. })
        );

        discard_page(&storage, &manager(), &pages[1].id, "duplicate scan")
            .await
            .unwrap();
        let known: Vec<_> = storage
            .bundle_pages(&bundle)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.classification.kind() == PageKind::Known)
            .collect();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].id, pages[0].id);
        push(&storage, &manager(), &bundle).await.unwrap();
    }

    #[tokio::test]
    async fn review_requires_manager() {
        let storage = small_storage(1).await;
        let bundle = staged_bundle(&storage, "b1", &[("p".into(), qr(1, 1, 1))]).await;
        let marker = Caller::new("ann", Role::Marker);
        assert_matches!(
            push(&storage, &marker, &bundle).await,
            Err(ScanmarkError::PermissionDenied { .. })
        );
    }

    #[tokio::test]
    async fn extra_page_replaces_marking_task() {
        let storage = small_storage(1).await;
        let scans: Vec<(String, Vec<String>)> = (1..=5)
            .map(|p| (format!("p{p}"), qr(1, p, 1)))
            .chain([("extra".to_string(), vec!["EXTRA1".to_string()])])
            .collect();
        let bundle = staged_bundle(&storage, "b1", &scans).await;
        let extra = storage.pages_needing_review(&bundle).await.unwrap().remove(0);
        assign_extra(&storage, &manager(), &extra.id, 1, vec![2])
            .await
            .unwrap();
        push(&storage, &manager(), &bundle).await.unwrap();

        let q2 = storage.group(1, GroupKind::Question(2)).await.unwrap().unwrap();
        assert_eq!(q2.pages.len(), 3);
        let filter = TaskFilter {
            question: Some(2),
            ..Default::default()
        };
        let claimed = storage.list_tasks(&filter).await.unwrap().remove(0);
        let lease = storage.claim_task(&claimed.id, "ann", None).await.unwrap();

        let outcome = discard_page(&storage, &manager(), &extra.id, "blank")
            .await
            .unwrap();
        assert_eq!(outcome.papers, vec![1]);
        assert_eq!(outcome.deltas.len(), 1);
        assert_eq!(outcome.deltas[0].change, GroupChange::ContentChanged);
        assert_eq!(outcome.deltas[0].invalidated, vec![claimed.id.clone()]);

        let tasks = storage.list_tasks(&filter).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::OutOfDate);
        assert_eq!(tasks[1].status, TaskStatus::ToDo);
        assert_eq!(outcome.deltas[0].created.as_ref(), Some(&tasks[1].id));

        let stale = storage
            .complete_mark(
                &claimed.id,
                "ann",
                &lease.integrity_token,
                &MarkSubmission {
                    score: 5.0,
                    marking_time_secs: 30.0,
                    rubrics: vec![],
                    payload: serde_json::Value::Null,
                },
                None,
            )
            .await;
        assert_matches!(stale, Err(ScanmarkError::StaleIntegrity { .. }));
    }

    #[tokio::test]
    async fn late_page_reopens_completed_mark() {
        let storage = small_storage(1).await;
        scanned_papers(&storage, "b1", &[1]).await;
        let filter = TaskFilter {
            question: Some(3),
            ..Default::default()
        };
        let marked = storage.list_tasks(&filter).await.unwrap().remove(0);
        let lease = storage.claim_task(&marked.id, "ann", None).await.unwrap();
        storage
            .complete_mark(
                &marked.id,
                "ann",
                &lease.integrity_token,
                &MarkSubmission {
                    score: 3.0,
                    marking_time_secs: 20.0,
                    rubrics: vec![],
                    payload: serde_json::Value::Null,
                },
                None,
            )
            .await
            .unwrap();

        let late = staged_bundle(
            &storage,
            "b2",
            &[("late".to_string(), vec!["EXTRA1".to_string()])],
        )
        .await;
        let extra = storage.pages_needing_review(&late).await.unwrap().remove(0);
        assign_extra(&storage, &manager(), &extra.id, 1, vec![3])
            .await
            .unwrap();
        let deltas = push_all(&storage, &late).await;

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].change, GroupChange::ContentChanged);
        assert_eq!(deltas[0].invalidated, vec![marked.id.clone()]);
        let fresh = deltas[0].created.clone().unwrap();

        assert_eq!(storage.task(&marked.id).await.unwrap().status, TaskStatus::OutOfDate);
        assert_eq!(storage.task(&fresh).await.unwrap().status, TaskStatus::ToDo);
        let relet = storage.claim_task(&fresh, "bob", None).await.unwrap();
        assert_ne!(relet.integrity_token, lease.integrity_token);
    }

    #[tokio::test]
    async fn discarding_a_required_page_waits_for_rescan() {
        let storage = small_storage(1).await;
        scanned_papers(&storage, "b1", &[1]).await;
        let filter = TaskFilter {
            question: Some(1),
            ..Default::default()
        };
        let original = storage.list_tasks(&filter).await.unwrap().remove(0);
        let lease = storage.claim_task(&original.id, "ann", None).await.unwrap();

        let q1 = storage.group(1, GroupKind::Question(1)).await.unwrap().unwrap();
        let q1_page = q1.pages[0].clone();
        let outcome = discard_page(&storage, &manager(), &q1_page, "smudged")
            .await
            .unwrap();
        assert_eq!(outcome.deltas[0].change, GroupChange::BecameUnscanned);
        assert_eq!(outcome.deltas[0].invalidated, vec![original.id.clone()]);
        let replacement = outcome.deltas[0].created.clone().unwrap();

        let submission = MarkSubmission {
            score: 1.0,
            marking_time_secs: 3.0,
            rubrics: vec![],
            payload: serde_json::Value::Null,
        };
        assert_matches!(
            storage
                .complete_mark(&original.id, "ann", &lease.integrity_token, &submission, None)
                .await,
            Err(ScanmarkError::StaleIntegrity { .. })
        );
        assert_matches!(
            storage.claim_task(&replacement, "ann", None).await,
            Err(ScanmarkError::InvalidTransition { .. })
        );

        let rescan = staged_bundle(&storage, "b2", &[("rescan".into(), qr(1, 2, 1))]).await;
        let deltas = push_all(&storage, &rescan).await;
        assert_eq!(deltas[0].change, GroupChange::BecameScanned);
        assert_eq!(deltas[0].created, None);
        storage.claim_task(&replacement, "ann", None).await.unwrap();
    }
}
