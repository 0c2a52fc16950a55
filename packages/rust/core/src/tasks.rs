//! Task engine: role checks, selection policy and completion validation
//! over the task rows in storage.
//!
//! The exactly-once claim and the integrity check live in storage as
//! atomic transitions; this layer decides *which* task a user may take and
//! whether a submitted result is acceptable.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};

use scanmark_shared::{
    Annotation, Caller, IdPrediction, Lease, MarkSubmission, PaperIdentity, PaperStatus,
    Permission, Result, ScanmarkError, Task, TaskFilter, TaskId, TaskKind,
    TaskPolicyConfig,
};
use scanmark_storage::{ClaimCandidate, IdentifySubmission, Storage};

use crate::access::{require_manager, require_worker};

/// Whether `permissions` allow work on `question` at `version`.
///
/// An empty set allows everything.
pub fn permits(permissions: &[Permission], question: u32, version: u32) -> bool {
    permissions.is_empty()
        || permissions
            .iter()
            .any(|p| p.question == question && p.version.is_none_or(|v| v == version))
}

/// Task operations on behalf of authenticated callers.
pub struct TaskEngine<'a> {
    storage: &'a Storage,
    policy: TaskPolicyConfig,
}

impl<'a> TaskEngine<'a> {
    pub fn new(storage: &'a Storage, policy: TaskPolicyConfig) -> Self {
        Self { storage, policy }
    }

    /// Explicit quota row, else the configured default, else unlimited.
    async fn quota_for(&self, user: &str) -> Result<Option<u32>> {
        Ok(self.storage.quota(user).await?.or(self.policy.default_quota))
    }

    async fn check_permitted(&self, caller: &Caller, task: &Task) -> Result<()> {
        let Some(question) = task.question() else {
            return Ok(());
        };
        let permissions = self.storage.permissions(&caller.username).await?;
        if permits(&permissions, question, task.version) {
            Ok(())
        } else {
            Err(ScanmarkError::PermissionDenied {
                user: caller.username.clone(),
                action: "work on this question and version",
            })
        }
    }

    /// ToDo tasks of `kind` the caller may take, in preference order.
    pub async fn available(&self, caller: &Caller, kind: TaskKind) -> Result<Vec<ClaimCandidate>> {
        require_worker(caller, "list tasks")?;
        let permissions = self.storage.permissions(&caller.username).await?;
        Ok(self
            .storage
            .claim_candidates(kind, &caller.username)
            .await?
            .into_iter()
            .filter(|c| match c.question {
                Some(q) => permits(&permissions, q, c.version),
                None => true,
            })
            .collect())
    }

    /// The task [`TaskEngine::claim_next`] would try first.
    pub async fn next_available(
        &self,
        caller: &Caller,
        kind: TaskKind,
    ) -> Result<Option<ClaimCandidate>> {
        Ok(self.available(caller, kind).await?.into_iter().next())
    }

    /// Lease a specific task.
    #[instrument(skip(self, caller), fields(user = %caller.username))]
    pub async fn claim(&self, caller: &Caller, task: &TaskId) -> Result<Lease> {
        require_worker(caller, "claim tasks")?;
        let current = self.storage.task(task).await?;
        self.check_permitted(caller, &current).await?;
        let quota = self.quota_for(&caller.username).await?;
        self.storage.claim_task(task, &caller.username, quota).await
    }

    /// Lease the best available task, skipping ones lost to a race.
    ///
    /// `Ok(None)` means nothing is available.
    #[instrument(skip(self, caller), fields(user = %caller.username))]
    pub async fn claim_next(&self, caller: &Caller, kind: TaskKind) -> Result<Option<Lease>> {
        let quota = self.quota_for(&caller.username).await?;
        for candidate in self.available(caller, kind).await? {
            match self
                .storage
                .claim_task(&candidate.task, &caller.username, quota)
                .await
            {
                Ok(lease) => return Ok(Some(lease)),
                Err(ScanmarkError::AlreadyClaimed { .. }) => {
                    debug!(task = %candidate.task, "lost claim race, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Give a leased task back.
    pub async fn release(&self, caller: &Caller, task: &TaskId) -> Result<()> {
        require_worker(caller, "release tasks")?;
        self.storage.release_task(task, &caller.username).await
    }

    /// Release every lease the caller holds (logout).
    pub async fn release_all(&self, caller: &Caller) -> Result<Vec<TaskId>> {
        require_worker(caller, "release tasks")?;
        self.storage.release_all(&caller.username).await
    }

    /// Release leases held longer than the configured timeout.
    #[instrument(skip(self, caller), fields(user = %caller.username))]
    pub async fn expire_leases(&self, caller: &Caller) -> Result<Vec<TaskId>> {
        require_manager(caller, "expire leases")?;
        let secs = i64::try_from(self.policy.lease_timeout_secs)
            .map_err(|_| ScanmarkError::config("lease_timeout_secs is too large"))?;
        let timeout = Duration::try_seconds(secs)
            .ok_or_else(|| ScanmarkError::config("lease_timeout_secs is too large"))?;
        let released = self.storage.release_stale(Utc::now() - timeout).await?;
        info!(released = released.len(), "stale leases released");
        Ok(released)
    }

    /// Validate and record a mark.
    #[instrument(skip(self, caller, token, submission), fields(user = %caller.username))]
    pub async fn complete_mark(
        &self,
        caller: &Caller,
        task: &TaskId,
        token: &str,
        submission: &MarkSubmission,
    ) -> Result<Annotation> {
        require_worker(caller, "mark")?;
        let current = self.storage.task(task).await?;
        let Some(question) = current.question() else {
            return Err(ScanmarkError::validation(format!("task {task} is not a mark task")));
        };
        let layout = self.storage.require_layout().await?;
        let max = layout.question(question).map(|q| q.mark).unwrap_or(0);
        if !(0.0..=f64::from(max)).contains(&submission.score) {
            return Err(ScanmarkError::ScoreOutOfRange {
                score: submission.score,
                max,
            });
        }

        let mut stale = false;
        let mut exclusive: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for cited in &submission.rubrics {
            let rubric = self
                .storage
                .rubric_revision(&cited.rid, cited.revision)
                .await?
                .ok_or_else(|| {
                    ScanmarkError::not_found("rubric", format!("{}@{}", cited.rid, cited.revision))
                })?;
            if !rubric.admits(question, current.version) {
                return Err(ScanmarkError::RubricOutOfScope {
                    rid: cited.rid.to_string(),
                    question,
                    version: current.version,
                });
            }
            if let (true, Some(group)) = (rubric.exclusive, &rubric.group) {
                exclusive
                    .entry(group.clone())
                    .or_default()
                    .push(cited.rid.to_string());
            }
            let latest = self.storage.latest_rubric(&cited.rid).await?;
            if latest.is_some_and(|l| l.revision > cited.revision) {
                stale = true;
            }
        }
        if let Some((group, rids)) = exclusive.into_iter().find(|(_, rids)| rids.len() > 1) {
            return Err(ScanmarkError::ExclusiveRubricConflict { group, rids });
        }
        if stale {
            warn!(%task, "mark cites a superseded rubric revision");
        }

        let review_tag = stale.then_some(self.policy.review_tag.as_str());
        self.storage
            .complete_mark(task, &caller.username, token, submission, review_tag)
            .await
    }

    /// Attach a student to the paper behind an identify task.
    #[instrument(skip(self, caller, token, submission), fields(user = %caller.username))]
    pub async fn complete_identify(
        &self,
        caller: &Caller,
        task: &TaskId,
        token: &str,
        submission: &IdentifySubmission,
    ) -> Result<PaperIdentity> {
        require_worker(caller, "identify papers")?;
        if submission.student_id.trim().is_empty() {
            return Err(ScanmarkError::validation("student id is empty"));
        }
        self.storage
            .complete_identify(task, &caller.username, token, submission)
            .await
    }

    pub async fn reset(&self, caller: &Caller, task: &TaskId) -> Result<Task> {
        require_manager(caller, "reset tasks")?;
        self.storage.reset_task(task).await
    }

    pub async fn reassign(&self, caller: &Caller, task: &TaskId, user: &str) -> Result<Lease> {
        require_manager(caller, "reassign tasks")?;
        self.storage.reassign_task(task, user).await
    }

    /// Retire a task's work and queue a replacement.
    pub async fn invalidate(&self, caller: &Caller, task: &TaskId) -> Result<Option<TaskId>> {
        require_manager(caller, "invalidate tasks")?;
        self.storage.invalidate_task(task).await
    }

    pub async fn tag(&self, caller: &Caller, task: &TaskId, tag: &str) -> Result<()> {
        require_worker(caller, "tag tasks")?;
        let tag = tag.trim();
        if tag.is_empty() || tag.contains(char::is_whitespace) {
            return Err(ScanmarkError::validation(format!("invalid tag {tag:?}")));
        }
        self.storage.add_tag(task, tag).await
    }

    pub async fn untag(&self, caller: &Caller, task: &TaskId, tag: &str) -> Result<bool> {
        require_worker(caller, "untag tasks")?;
        self.storage.remove_tag(task, tag.trim()).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.storage.list_tasks(filter).await
    }

    /// Store an advisory ID prediction. Never completes a task.
    pub async fn record_prediction(&self, caller: &Caller, prediction: &IdPrediction) -> Result<()> {
        require_manager(caller, "record predictions")?;
        self.storage.record_prediction(prediction).await
    }

    pub async fn predictions(&self, paper: u32) -> Result<Vec<IdPrediction>> {
        self.storage.predictions(paper).await
    }

    pub async fn paper_status(&self, paper: u32) -> Result<PaperStatus> {
        self.storage.paper_status(paper).await
    }

    pub async fn set_quota(&self, caller: &Caller, user: &str, limit: Option<u32>) -> Result<()> {
        require_manager(caller, "set quotas")?;
        self.storage.set_quota(user, limit).await
    }

    pub async fn set_permissions(
        &self,
        caller: &Caller,
        user: &str,
        permissions: &[Permission],
    ) -> Result<()> {
        require_manager(caller, "set permissions")?;
        self.storage.set_permissions(user, permissions).await
    }
}
