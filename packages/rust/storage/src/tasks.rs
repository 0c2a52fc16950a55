//! Task rows: creation, leasing, completion and tags.
//!
//! Every state transition is a conditional `UPDATE` on the task row. A
//! transition that matches no row is diagnosed afterwards by re-reading the
//! task, so callers always get a typed reason.

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use scanmark_shared::{
    Annotation, AnnotationId, GroupKind, GroupRecord, Lease, MarkSubmission, PaperIdentity,
    Result, ScanmarkError, Task, TaskFilter, TaskId, TaskKind, TaskStatus,
};
use tracing::{info, warn};

use crate::Storage;
use crate::groups::group_on;
use crate::rows::{
    db_err, int, next, now_text, opt_int, opt_text, opt_timestamp, parsed, text, timestamp,
    to_json, ts_text,
};

const TASK_COLUMNS: &str = "t.id, t.kind, t.paper_number, t.group_label, t.version, t.status, \
     t.assigned_user, t.claimed_at, t.integrity_token, t.created_at";

/// A ToDo task offered to a user, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCandidate {
    pub task: TaskId,
    pub paper: u32,
    pub question: Option<u32>,
    pub version: u32,
    /// Tagged `@user` for the asking user.
    pub flagged: bool,
}

/// What an identifier submits when completing an identify task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifySubmission {
    pub student_id: String,
    pub student_name: String,
}

fn row_to_task(row: &Row) -> Result<Task> {
    let label = text(row, 3)?;
    Ok(Task {
        id: parsed(row, 0)?,
        kind: parsed(row, 1)?,
        paper: int(row, 2)?,
        group: GroupKind::from_label(&label)
            .ok_or_else(|| ScanmarkError::Storage(format!("bad group label {label:?}")))?,
        version: int(row, 4)?,
        status: parsed(row, 5)?,
        assigned_user: opt_text(row, 6),
        claimed_at: opt_timestamp(row, 7)?,
        integrity_token: opt_text(row, 8),
        tags: Vec::new(),
        created_at: timestamp(row, 9)?,
    })
}

async fn tags_on(conn: &Connection, id: &TaskId) -> Result<Vec<String>> {
    let mut rows = conn
        .query(
            "SELECT tag FROM task_tags WHERE task_id = ?1 ORDER BY tag",
            params![id.to_string()],
        )
        .await
        .map_err(db_err)?;
    let mut out = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        out.push(text(&row, 0)?);
    }
    Ok(out)
}

pub(crate) async fn task_on(conn: &Connection, id: &TaskId) -> Result<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1");
    let mut rows = conn
        .query(&sql, params![id.to_string()])
        .await
        .map_err(db_err)?;
    let row = next(&mut rows)
        .await?
        .ok_or_else(|| ScanmarkError::not_found("task", id))?;
    let mut task = row_to_task(&row)?;
    drop(rows);
    task.tags = tags_on(conn, id).await?;
    Ok(task)
}

async fn latest_annotation_id_on(conn: &Connection, id: &TaskId) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "SELECT latest_annotation FROM tasks WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(db_err)?;
    Ok(match next(&mut rows).await? {
        Some(row) => opt_text(&row, 0),
        None => None,
    })
}

/// Create a ToDo task for a scanned group unless a live task exists.
pub(crate) async fn ensure_task_on(conn: &Connection, group: &GroupRecord) -> Result<Option<TaskId>> {
    let Some(kind) = group.kind.task_kind() else {
        return Ok(None);
    };
    let mut rows = conn
        .query(
            "SELECT 1 FROM tasks
             WHERE paper_number = ?1 AND group_label = ?2 AND status != 'out_of_date'",
            params![group.paper, group.kind.label()],
        )
        .await
        .map_err(db_err)?;
    if next(&mut rows).await?.is_some() {
        return Ok(None);
    }
    drop(rows);

    let id = TaskId::new();
    let now = now_text();
    conn.execute(
        "INSERT INTO tasks (id, kind, paper_number, group_label, question, version, status,
           created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'todo', ?7, ?7)",
        params![
            id.to_string(),
            kind.as_str(),
            group.paper,
            group.kind.label(),
            group.kind.question().map(i64::from),
            group.version,
            now
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(Some(id))
}

/// Move the Out/Complete task of a group to OutOfDate.
///
/// Identities recorded by an invalidated identify task are cleared;
/// annotations are kept as history.
pub(crate) async fn invalidate_worked_on(
    conn: &Connection,
    paper: u32,
    kind: GroupKind,
) -> Result<Vec<TaskId>> {
    let mut rows = conn
        .query(
            "UPDATE tasks SET status = 'out_of_date', updated_at = ?3
             WHERE paper_number = ?1 AND group_label = ?2 AND status IN ('out', 'complete')
             RETURNING id",
            params![paper, kind.label(), now_text()],
        )
        .await
        .map_err(db_err)?;
    let mut ids = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        ids.push(parsed::<TaskId>(&row, 0)?);
    }
    drop(rows);

    if !ids.is_empty() && kind == GroupKind::Id {
        conn.execute(
            "DELETE FROM paper_identities WHERE paper_number = ?1",
            params![paper],
        )
        .await
        .map_err(db_err)?;
    }
    for id in &ids {
        warn!(task = %id, paper, group = %kind.label(), "task out of date");
    }
    Ok(ids)
}

pub(crate) async fn add_tag_on(conn: &Connection, id: &TaskId, tag: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO task_tags (task_id, tag, created_at) VALUES (?1, ?2, ?3)",
        params![id.to_string(), tag, now_text()],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Current integrity token of the group a task works on.
async fn current_token_on(conn: &Connection, task: &Task) -> Result<Option<String>> {
    Ok(group_on(conn, task.paper, task.group)
        .await?
        .filter(|g| g.scanned)
        .and_then(|g| g.content_hash))
}

/// Check that `user` may complete `task` with `token`.
async fn check_completion_on(
    conn: &Connection,
    task: &Task,
    user: &str,
    token: &str,
) -> Result<()> {
    match task.status {
        TaskStatus::Out | TaskStatus::OutOfDate => {}
        other => {
            return Err(ScanmarkError::InvalidTransition {
                task: task.id.to_string(),
                status: other.to_string(),
                action: "complete",
            });
        }
    }
    if task.assigned_user.as_deref() != Some(user) {
        return Err(ScanmarkError::NotLeaseHolder {
            task: task.id.to_string(),
            user: user.to_string(),
        });
    }
    let current = current_token_on(conn, task).await?;
    if task.status == TaskStatus::OutOfDate
        || task.integrity_token.as_deref() != Some(token)
        || current.as_deref() != Some(token)
    {
        warn!(task = %task.id, user, presented = token, ?current, "stale completion rejected");
        return Err(ScanmarkError::StaleIntegrity {
            task: task.id.to_string(),
            presented: token.to_string(),
            current,
        });
    }
    Ok(())
}

/// Flip a leased task to Complete, checking the lease once more.
async fn finish_on(
    conn: &Connection,
    task: &Task,
    user: &str,
    token: &str,
    annotation: Option<&AnnotationId>,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE tasks SET status = 'complete', latest_annotation = ?4, updated_at = ?5
             WHERE id = ?1 AND status = 'out' AND assigned_user = ?2 AND integrity_token = ?3",
            params![
                task.id.to_string(),
                user,
                token,
                annotation.map(|a| a.to_string()),
                now_text()
            ],
        )
        .await
        .map_err(db_err)?;
    if changed != 1 {
        return Err(ScanmarkError::StaleIntegrity {
            task: task.id.to_string(),
            presented: token.to_string(),
            current: None,
        });
    }
    Ok(())
}

impl Storage {
    pub async fn task(&self, id: &TaskId) -> Result<Task> {
        task_on(self.conn(), id).await
    }

    /// Tasks matching every set field of `filter`.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t
             WHERE (?1 IS NULL OR t.kind = ?1)
               AND (?2 IS NULL OR t.status = ?2)
               AND (?3 IS NULL OR t.paper_number = ?3)
               AND (?4 IS NULL OR t.question = ?4)
               AND (?5 IS NULL OR t.version = ?5)
               AND (?6 IS NULL OR t.assigned_user = ?6)
               AND (?7 IS NULL OR EXISTS (
                     SELECT 1 FROM task_tags tt WHERE tt.task_id = t.id AND tt.tag = ?7))
             ORDER BY t.paper_number, t.kind, t.question, t.created_at"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    filter.kind.map(|k| k.as_str()),
                    filter.status.map(|s| s.as_str()),
                    filter.paper.map(i64::from),
                    filter.question.map(i64::from),
                    filter.version.map(i64::from),
                    filter.user.as_deref(),
                    filter.tag.as_deref()
                ],
            )
            .await
            .map_err(db_err)?;
        let mut tasks = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            tasks.push(row_to_task(&row)?);
        }
        drop(rows);
        for task in &mut tasks {
            task.tags = tags_on(self.conn(), &task.id).await?;
        }
        Ok(tasks)
    }

    /// Claimable ToDo tasks of `kind`, tasks flagged `@user` first, then by paper.
    pub async fn claim_candidates(&self, kind: TaskKind, user: &str) -> Result<Vec<ClaimCandidate>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT t.id, t.paper_number, t.question, t.version,
                   EXISTS (SELECT 1 FROM task_tags tt WHERE tt.task_id = t.id AND tt.tag = ?2)
                     AS flagged
                 FROM tasks t
                 JOIN paper_groups g
                   ON g.paper_number = t.paper_number AND g.group_label = t.group_label
                 WHERE t.status = 'todo' AND t.kind = ?1 AND g.scanned = 1
                 ORDER BY flagged DESC, t.paper_number, t.question",
                params![kind.as_str(), scanmark_shared::user_tag(user)],
            )
            .await
            .map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            out.push(ClaimCandidate {
                task: parsed(&row, 0)?,
                paper: int(&row, 1)?,
                question: opt_int(&row, 2),
                version: int(&row, 3)?,
                flagged: crate::rows::flag(&row, 4)?,
            });
        }
        Ok(out)
    }

    /// Number of Out and Complete tasks held by `user`.
    pub async fn worked_count(&self, user: &str) -> Result<u64> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE assigned_user = ?1 AND status IN ('out', 'complete')",
                params![user],
            )
            .await
            .map_err(db_err)?;
        match next(&mut rows).await? {
            Some(row) => crate::rows::count(&row, 0),
            None => Ok(0),
        }
    }

    /// Lease a ToDo task to `user` in a single conditional update.
    ///
    /// The task must be ToDo, its group scanned and, when `quota` is set, the
    /// user must hold fewer than `quota` Out/Complete tasks. The lease's
    /// integrity token is the group's content hash at this moment.
    pub async fn claim_task(&self, id: &TaskId, user: &str, quota: Option<u32>) -> Result<Lease> {
        let conn = self.lock_writes().await?;
        let now = Utc::now();
        let mut rows = conn
            .query(
                "UPDATE tasks SET
                   status = 'out',
                   assigned_user = ?2,
                   claimed_at = ?3,
                   updated_at = ?3,
                   integrity_token = (
                     SELECT g.content_hash FROM paper_groups g
                     WHERE g.paper_number = tasks.paper_number AND g.group_label = tasks.group_label)
                 WHERE id = ?1 AND status = 'todo'
                   AND EXISTS (
                     SELECT 1 FROM paper_groups g
                     WHERE g.paper_number = tasks.paper_number
                       AND g.group_label = tasks.group_label
                       AND g.scanned = 1)
                   AND (?4 IS NULL OR (
                     SELECT COUNT(*) FROM tasks w
                     WHERE w.assigned_user = ?2 AND w.status IN ('out', 'complete')) < ?4)
                 RETURNING integrity_token",
                params![id.to_string(), user, ts_text(&now), quota.map(i64::from)],
            )
            .await
            .map_err(db_err)?;

        if let Some(row) = next(&mut rows).await? {
            let lease = Lease {
                task: id.clone(),
                user: user.to_string(),
                integrity_token: text(&row, 0)?,
                claimed_at: now,
            };
            info!(task = %id, user, "task claimed");
            return Ok(lease);
        }
        drop(rows);

        let task = task_on(self.conn(), id).await?;
        let group_scanned = current_token_on(self.conn(), &task).await?.is_some();
        Err(match task.status {
            TaskStatus::Out | TaskStatus::Complete => ScanmarkError::AlreadyClaimed {
                task: id.to_string(),
                holder: task.assigned_user,
            },
            TaskStatus::OutOfDate => ScanmarkError::InvalidTransition {
                task: id.to_string(),
                status: task.status.to_string(),
                action: "claim",
            },
            TaskStatus::ToDo => match quota {
                Some(limit) if group_scanned => {
                    ScanmarkError::QuotaExceeded {
                        user: user.to_string(),
                        limit,
                    }
                }
                _ => ScanmarkError::InvalidTransition {
                    task: id.to_string(),
                    status: "todo (group not scanned)".into(),
                    action: "claim",
                },
            },
        })
    }

    /// Give a leased task back to the pool.
    pub async fn release_task(&self, id: &TaskId, user: &str) -> Result<()> {
        let conn = self.lock_writes().await?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'todo', assigned_user = NULL, claimed_at = NULL,
                   integrity_token = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'out' AND assigned_user = ?2",
                params![id.to_string(), user, now_text()],
            )
            .await
            .map_err(db_err)?;
        if changed == 1 {
            info!(task = %id, user, "task released");
            return Ok(());
        }

        let task = task_on(self.conn(), id).await?;
        Err(if task.status != TaskStatus::Out {
            ScanmarkError::InvalidTransition {
                task: id.to_string(),
                status: task.status.to_string(),
                action: "release",
            }
        } else {
            ScanmarkError::NotLeaseHolder {
                task: id.to_string(),
                user: user.to_string(),
            }
        })
    }

    /// Release every Out task held by `user`.
    pub async fn release_all(&self, user: &str) -> Result<Vec<TaskId>> {
        let conn = self.lock_writes().await?;
        let mut rows = conn
            .query(
                "UPDATE tasks SET status = 'todo', assigned_user = NULL, claimed_at = NULL,
                   integrity_token = NULL, updated_at = ?2
                 WHERE status = 'out' AND assigned_user = ?1
                 RETURNING id",
                params![user, now_text()],
            )
            .await
            .map_err(db_err)?;
        let mut ids = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            ids.push(parsed(&row, 0)?);
        }
        info!(user, released = ids.len(), "released all leases");
        Ok(ids)
    }

    /// Release every Out task claimed before `cutoff`.
    pub async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let conn = self.lock_writes().await?;
        let mut rows = conn
            .query(
                "UPDATE tasks SET status = 'todo', assigned_user = NULL, claimed_at = NULL,
                   integrity_token = NULL, updated_at = ?2
                 WHERE status = 'out' AND claimed_at < ?1
                 RETURNING id",
                params![ts_text(&cutoff), now_text()],
            )
            .await
            .map_err(db_err)?;
        let mut ids = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            ids.push(parsed(&row, 0)?);
        }
        if !ids.is_empty() {
            info!(released = ids.len(), cutoff = %cutoff, "expired leases released");
        }
        Ok(ids)
    }

    /// Hand a ToDo or Out task to `user`, issuing a fresh lease.
    pub async fn reassign_task(&self, id: &TaskId, user: &str) -> Result<Lease> {
        let conn = self.lock_writes().await?;
        let now = Utc::now();
        let mut rows = conn
            .query(
                "UPDATE tasks SET
                   status = 'out',
                   assigned_user = ?2,
                   claimed_at = ?3,
                   updated_at = ?3,
                   integrity_token = (
                     SELECT g.content_hash FROM paper_groups g
                     WHERE g.paper_number = tasks.paper_number AND g.group_label = tasks.group_label)
                 WHERE id = ?1 AND status IN ('todo', 'out')
                   AND EXISTS (
                     SELECT 1 FROM paper_groups g
                     WHERE g.paper_number = tasks.paper_number
                       AND g.group_label = tasks.group_label
                       AND g.scanned = 1)
                 RETURNING integrity_token",
                params![id.to_string(), user, ts_text(&now)],
            )
            .await
            .map_err(db_err)?;
        if let Some(row) = next(&mut rows).await? {
            info!(task = %id, user, "task reassigned");
            return Ok(Lease {
                task: id.clone(),
                user: user.to_string(),
                integrity_token: text(&row, 0)?,
                claimed_at: now,
            });
        }
        drop(rows);

        let task = task_on(self.conn(), id).await?;
        Err(ScanmarkError::InvalidTransition {
            task: id.to_string(),
            status: task.status.to_string(),
            action: "reassign",
        })
    }

    /// Send a Complete task back to ToDo, discarding its result.
    pub async fn reset_task(&self, id: &TaskId) -> Result<Task> {
        let tx = self.begin_write().await?;
        let task = task_on(&tx, id).await?;
        if task.status != TaskStatus::Complete {
            return Err(ScanmarkError::InvalidTransition {
                task: id.to_string(),
                status: task.status.to_string(),
                action: "reset",
            });
        }

        if let Some(annotation) = latest_annotation_id_on(&tx, id).await? {
            tx.execute(
                "UPDATE annotations SET discarded = 1 WHERE id = ?1",
                params![annotation],
            )
            .await
            .map_err(db_err)?;
        }
        if task.kind == TaskKind::Identify {
            tx.execute(
                "DELETE FROM paper_identities WHERE paper_number = ?1",
                params![task.paper],
            )
            .await
            .map_err(db_err)?;
        }
        tx.execute(
            "UPDATE tasks SET status = 'todo', assigned_user = NULL, claimed_at = NULL,
               integrity_token = NULL, latest_annotation = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'complete'",
            params![id.to_string(), now_text()],
        )
        .await
        .map_err(db_err)?;
        let task = task_on(&tx, id).await?;
        tx.commit().await?;

        info!(task = %id, "task reset");
        Ok(task)
    }

    /// Move an Out or Complete task to OutOfDate and replace it with a fresh
    /// ToDo task.
    pub async fn invalidate_task(&self, id: &TaskId) -> Result<Option<TaskId>> {
        let tx = self.begin_write().await?;
        let task = task_on(&tx, id).await?;
        if !matches!(task.status, TaskStatus::Out | TaskStatus::Complete) {
            return Err(ScanmarkError::InvalidTransition {
                task: id.to_string(),
                status: task.status.to_string(),
                action: "invalidate",
            });
        }
        invalidate_worked_on(&tx, task.paper, task.group).await?;

        let created = match group_on(&tx, task.paper, task.group).await? {
            Some(group) => ensure_task_on(&tx, &group).await?,
            None => None,
        };
        tx.commit().await?;

        info!(task = %id, replacement = ?created.as_ref().map(|t| t.to_string()), "task invalidated");
        Ok(created)
    }

    /// Record a mark and complete the task.
    ///
    /// The edition is one more than the highest edition for the paper and
    /// question. `review_tag` is attached in the same transaction.
    pub async fn complete_mark(
        &self,
        id: &TaskId,
        user: &str,
        token: &str,
        submission: &MarkSubmission,
        review_tag: Option<&str>,
    ) -> Result<Annotation> {
        let tx = self.begin_write().await?;
        let task = task_on(&tx, id).await?;
        let Some(question) = task.question() else {
            return Err(ScanmarkError::validation(format!(
                "task {id} is an {} task",
                task.kind
            )));
        };
        check_completion_on(&tx, &task, user, token).await?;

        let mut rows = tx
            .query(
                "SELECT COALESCE(MAX(edition), 0) + 1 FROM annotations
                 WHERE paper_number = ?1 AND question = ?2",
                params![task.paper, question],
            )
            .await
            .map_err(db_err)?;
        let edition = match next(&mut rows).await? {
            Some(row) => int(&row, 0)?,
            None => 1,
        };
        drop(rows);

        let annotation = Annotation {
            id: AnnotationId::new(),
            task: id.clone(),
            paper: task.paper,
            question,
            username: user.to_string(),
            edition,
            score: submission.score,
            marking_time_secs: submission.marking_time_secs,
            integrity_token: token.to_string(),
            rubrics: submission.rubrics.clone(),
            payload: submission.payload.clone(),
            discarded: false,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO annotations (id, task_id, paper_number, question, username, edition,
               score, marking_time_secs, integrity_token, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                annotation.id.to_string(),
                id.to_string(),
                task.paper,
                question,
                user,
                edition,
                annotation.score,
                annotation.marking_time_secs,
                token,
                to_json(&annotation.payload)?,
                ts_text(&annotation.created_at)
            ],
        )
        .await
        .map_err(db_err)?;
        for (position, rubric) in annotation.rubrics.iter().enumerate() {
            tx.execute(
                "INSERT INTO annotation_rubrics (annotation_id, position, rid, revision)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    annotation.id.to_string(),
                    position as i64,
                    rubric.rid.to_string(),
                    rubric.revision
                ],
            )
            .await
            .map_err(db_err)?;
        }

        finish_on(&tx, &task, user, token, Some(&annotation.id)).await?;
        if let Some(tag) = review_tag {
            add_tag_on(&tx, id, tag).await?;
        }
        tx.commit().await?;

        info!(task = %id, user, paper = task.paper, question, edition, score = annotation.score, "mark recorded");
        Ok(annotation)
    }

    /// Attach a student to the paper and complete the identify task.
    pub async fn complete_identify(
        &self,
        id: &TaskId,
        user: &str,
        token: &str,
        submission: &IdentifySubmission,
    ) -> Result<PaperIdentity> {
        let tx = self.begin_write().await?;
        let task = task_on(&tx, id).await?;
        if task.kind != TaskKind::Identify {
            return Err(ScanmarkError::validation(format!(
                "task {id} is a {} task",
                task.kind
            )));
        }
        check_completion_on(&tx, &task, user, token).await?;

        let mut rows = tx
            .query(
                "SELECT paper_number FROM paper_identities WHERE student_id = ?1",
                params![submission.student_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        if let Some(row) = next(&mut rows).await? {
            let paper = int(&row, 0)?;
            if paper != task.paper {
                return Err(ScanmarkError::StudentAlreadyIdentified {
                    student_id: submission.student_id.clone(),
                    paper,
                });
            }
        }
        drop(rows);

        let identity = PaperIdentity {
            paper: task.paper,
            student_id: submission.student_id.clone(),
            student_name: submission.student_name.clone(),
            username: user.to_string(),
            created_at: Utc::now(),
        };
        tx.execute(
            "DELETE FROM paper_identities WHERE paper_number = ?1",
            params![task.paper],
        )
        .await
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO paper_identities (paper_number, student_id, student_name, username, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.paper,
                identity.student_id.as_str(),
                identity.student_name.as_str(),
                user,
                ts_text(&identity.created_at)
            ],
        )
        .await
        .map_err(db_err)?;
        finish_on(&tx, &task, user, token, None).await?;
        tx.commit().await?;

        info!(task = %id, user, paper = task.paper, "paper identified");
        Ok(identity)
    }

    /// Attach a tag to a task in any state.
    pub async fn add_tag(&self, id: &TaskId, tag: &str) -> Result<()> {
        let tx = self.begin_write().await?;
        task_on(&tx, id).await?;
        add_tag_on(&tx, id, tag).await?;
        tx.commit().await
    }

    /// Detach a tag. Returns whether it was present.
    pub async fn remove_tag(&self, id: &TaskId, tag: &str) -> Result<bool> {
        let tx = self.begin_write().await?;
        task_on(&tx, id).await?;
        let removed = tx
            .execute(
                "DELETE FROM task_tags WHERE task_id = ?1 AND tag = ?2",
                params![id.to_string(), tag],
            )
            .await
            .map_err(db_err)?;
        tx.commit().await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::tests::{QuestionPlanner, scanned_paper, scanned_paper_at};
    use crate::test_support::test_db_path;
    use crate::PageAction;
    use assert_matches::assert_matches;
    use scanmark_shared::{ImageId, RubricId, RubricRef};
    use std::sync::Arc;

    async fn mark_task(storage: &Storage, question: u32) -> Task {
        let filter = TaskFilter {
            question: Some(question),
            status: Some(TaskStatus::ToDo),
            ..Default::default()
        };
        storage.list_tasks(&filter).await.unwrap().remove(0)
    }

    fn submission(score: f64) -> MarkSubmission {
        MarkSubmission {
            score,
            marking_time_secs: 12.0,
            rubrics: vec![RubricRef {
                rid: RubricId::new(),
                revision: 1,
            }],
            payload: serde_json::json!({"strokes": 3}),
        }
    }

    #[tokio::test]
    async fn claim_complete_and_editions() {
        let storage = scanned_paper().await;
        let task = mark_task(&storage, 1).await;

        let lease = storage.claim_task(&task.id, "ann", None).await.unwrap();
        assert_eq!(lease.integrity_token, "p1-2");

        let first = storage
            .complete_mark(&task.id, "ann", &lease.integrity_token, &submission(3.0), None)
            .await
            .unwrap();
        assert_eq!(first.edition, 1);
        assert_eq!(storage.task(&task.id).await.unwrap().status, TaskStatus::Complete);

        let reset = storage.reset_task(&task.id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::ToDo);
        assert!(reset.assigned_user.is_none());

        let lease = storage.claim_task(&task.id, "bob", None).await.unwrap();
        let second = storage
            .complete_mark(&task.id, "bob", &lease.integrity_token, &submission(4.0), Some("check"))
            .await
            .unwrap();
        assert_eq!(second.edition, 2);
        assert_eq!(storage.task(&task.id).await.unwrap().tags, vec!["check"]);
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let storage = Arc::new(scanned_paper().await);
        let task = mark_task(&storage, 2).await;

        let a = tokio::spawn({
            let storage = Arc::clone(&storage);
            let id = task.id.clone();
            async move { storage.claim_task(&id, "ann", None).await }
        });
        let b = tokio::spawn({
            let storage = Arc::clone(&storage);
            let id = task.id.clone();
            async move { storage.claim_task(&id, "bob", None).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ScanmarkError::AlreadyClaimed { .. }))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn claims_across_handles_are_exclusive() {
        let path = test_db_path();
        let first = Arc::new(scanned_paper_at(&path).await);
        let second = Arc::new(Storage::open(&path).await.unwrap());
        let todo = first
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::ToDo),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(todo.len(), 3);

        let mut claims = Vec::new();
        for task in &todo {
            for (storage, user) in [(&first, "ann"), (&second, "bob")] {
                let storage = Arc::clone(storage);
                let id = task.id.clone();
                claims.push(tokio::spawn(async move {
                    storage.claim_task(&id, user, None).await
                }));
            }
        }

        let (mut leased, mut raced) = (0, 0);
        for claim in claims {
            match claim.await.unwrap() {
                Ok(_) => leased += 1,
                Err(ScanmarkError::AlreadyClaimed { .. }) => raced += 1,
                Err(e) => panic!("unexpected claim failure: {e}"),
            }
        }
        assert_eq!((leased, raced), (3, 3));

        let out = second
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Out),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn quota_limits_claims() {
        let storage = scanned_paper().await;
        let q1 = mark_task(&storage, 1).await;
        let q2 = mark_task(&storage, 2).await;
        storage.claim_task(&q1.id, "ann", Some(1)).await.unwrap();
        assert_matches!(
            storage.claim_task(&q2.id, "ann", Some(1)).await,
            Err(ScanmarkError::QuotaExceeded { limit: 1, .. })
        );
        assert_eq!(storage.worked_count("ann").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_and_expiry() {
        let storage = scanned_paper().await;
        let q1 = mark_task(&storage, 1).await;
        let q2 = mark_task(&storage, 2).await;
        storage.claim_task(&q1.id, "ann", None).await.unwrap();
        storage.claim_task(&q2.id, "ann", None).await.unwrap();

        assert_matches!(
            storage.release_task(&q1.id, "bob").await,
            Err(ScanmarkError::NotLeaseHolder { .. })
        );
        storage.release_task(&q1.id, "ann").await.unwrap();
        assert_matches!(
            storage.release_task(&q1.id, "ann").await,
            Err(ScanmarkError::InvalidTransition { .. })
        );

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(storage.release_stale(past).await.unwrap().is_empty());
        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(storage.release_stale(future).await.unwrap(), vec![q2.id.clone()]);
    }

    #[tokio::test]
    async fn reassign_moves_lease() {
        let storage = scanned_paper().await;
        let task = mark_task(&storage, 3).await;
        let old = storage.claim_task(&task.id, "ann", None).await.unwrap();
        let new = storage.reassign_task(&task.id, "bob").await.unwrap();
        assert_eq!(new.user, "bob");

        assert_matches!(
            storage
                .complete_mark(&task.id, "ann", &old.integrity_token, &submission(1.0), None)
                .await,
            Err(ScanmarkError::NotLeaseHolder { .. })
        );
        storage
            .complete_mark(&task.id, "bob", &new.integrity_token, &submission(1.0), None)
            .await
            .unwrap();
        assert_matches!(
            storage.reassign_task(&task.id, "cat").await,
            Err(ScanmarkError::InvalidTransition { .. })
        );
    }

    #[tokio::test]
    async fn discarded_page_invalidates_lease() {
        let storage = scanned_paper().await;
        let task = mark_task(&storage, 2).await;
        let lease = storage.claim_task(&task.id, "ann", None).await.unwrap();

        let page_id: ImageId = storage.group(1, GroupKind::Question(2)).await.unwrap().unwrap().pages[0].clone();
        let PageAction { papers, .. } = storage.discard_page(&page_id, "smudged").await.unwrap();
        assert_eq!(papers, vec![1]);
        let deltas = storage.reconcile_paper(1, &QuestionPlanner).await.unwrap();
        assert_eq!(deltas[0].invalidated, vec![task.id.clone()]);

        assert_eq!(storage.task(&task.id).await.unwrap().status, TaskStatus::OutOfDate);
        assert_matches!(
            storage
                .complete_mark(&task.id, "ann", &lease.integrity_token, &submission(5.0), None)
                .await,
            Err(ScanmarkError::StaleIntegrity { .. })
        );
    }

    #[tokio::test]
    async fn tags_and_flagging() {
        let storage = scanned_paper().await;
        let q3 = mark_task(&storage, 3).await;
        storage.add_tag(&q3.id, "@bob").await.unwrap();
        storage.add_tag(&q3.id, "@bob").await.unwrap();

        let for_bob = storage.claim_candidates(TaskKind::Mark, "bob").await.unwrap();
        assert_eq!(for_bob[0].task, q3.id);
        assert!(for_bob[0].flagged);
        let for_ann = storage.claim_candidates(TaskKind::Mark, "ann").await.unwrap();
        assert_eq!(for_ann.len(), 3);
        assert!(!for_ann[0].flagged);

        let tagged = storage
            .list_tasks(&TaskFilter {
                tag: Some("@bob".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert!(storage.remove_tag(&q3.id, "@bob").await.unwrap());
        assert!(!storage.remove_tag(&q3.id, "@bob").await.unwrap());
    }
}
