//! Rubric snapshots.
//!
//! A rubric is never updated in place. Each change inserts a new
//! `(rid, revision, subrevision)` row; minor edits bump the subrevision,
//! major edits bump the revision and tag the results that cite an older one.

use libsql::{Connection, Row, params};
use scanmark_shared::{Result, Rubric, RubricId, ScanmarkError, TaskId};
use tracing::info;

use crate::Storage;
use crate::rows::{
    db_err, flag, int, json, next, opt_text, parsed, real, text, timestamp, to_json, ts_text,
};
use crate::tasks::add_tag_on;

const RUBRIC_COLUMNS: &str = "rid, revision, subrevision, kind, value, text, question, \
     versions_json, group_label, exclusive, author, created_at";

/// Outcome of a major revision.
#[derive(Debug, Clone)]
pub struct MajorRevision {
    pub rubric: Rubric,
    /// Complete tasks whose latest result cites an older revision.
    pub tagged: Vec<TaskId>,
}

fn row_to_rubric(row: &Row) -> Result<Rubric> {
    Ok(Rubric {
        rid: parsed(row, 0)?,
        revision: int(row, 1)?,
        subrevision: int(row, 2)?,
        kind: parsed(row, 3)?,
        value: real(row, 4)?,
        text: text(row, 5)?,
        question: int(row, 6)?,
        versions: json(row, 7)?,
        group: opt_text(row, 8),
        exclusive: flag(row, 9)?,
        author: text(row, 10)?,
        created_at: timestamp(row, 11)?,
    })
}

async fn latest_on(conn: &Connection, rid: &RubricId) -> Result<Option<Rubric>> {
    let sql = format!(
        "SELECT {RUBRIC_COLUMNS} FROM rubrics WHERE rid = ?1
         ORDER BY revision DESC, subrevision DESC LIMIT 1"
    );
    let mut rows = conn
        .query(&sql, params![rid.to_string()])
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => Ok(Some(row_to_rubric(&row)?)),
        None => Ok(None),
    }
}

async fn insert_on(conn: &Connection, rubric: &Rubric) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO rubrics ({RUBRIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            rubric.rid.to_string(),
            rubric.revision,
            rubric.subrevision,
            rubric.kind.as_str(),
            rubric.value,
            rubric.text.as_str(),
            rubric.question,
            to_json(&rubric.versions)?,
            rubric.group.as_deref(),
            i64::from(rubric.exclusive),
            rubric.author.as_str(),
            ts_text(&rubric.created_at)
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

fn out_of_sequence(rubric: &Rubric, latest: Option<&Rubric>) -> ScanmarkError {
    let current = latest
        .map(|r| format!("{}.{}", r.revision, r.subrevision))
        .unwrap_or_else(|| "none".into());
    ScanmarkError::validation(format!(
        "rubric {} revision {}.{} does not follow {current}",
        rubric.rid, rubric.revision, rubric.subrevision
    ))
}

async fn rubrics_where(
    conn: &Connection,
    sql: &str,
    args: impl libsql::params::IntoParams,
) -> Result<Vec<Rubric>> {
    let mut rows = conn.query(sql, args).await.map_err(db_err)?;
    let mut out = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        out.push(row_to_rubric(&row)?);
    }
    Ok(out)
}

impl Storage {
    /// Insert a new rubric (1.0) or a minor revision of the latest one.
    pub async fn insert_rubric(&self, rubric: &Rubric) -> Result<()> {
        let tx = self.begin_write().await?;
        let latest = latest_on(&tx, &rubric.rid).await?;
        let follows = match &latest {
            None => rubric.revision == 1 && rubric.subrevision == 0,
            Some(prev) => {
                rubric.revision == prev.revision && rubric.subrevision == prev.subrevision + 1
            }
        };
        if !follows {
            return Err(out_of_sequence(rubric, latest.as_ref()));
        }
        insert_on(&tx, rubric).await?;
        tx.commit().await?;

        info!(rid = %rubric.rid, revision = rubric.revision, subrevision = rubric.subrevision, "rubric stored");
        Ok(())
    }

    /// Insert the next major revision and tag every Complete task whose
    /// latest result cites an older revision of the same rubric.
    pub async fn revise_major(&self, rubric: &Rubric, review_tag: &str) -> Result<MajorRevision> {
        let tx = self.begin_write().await?;
        let latest = latest_on(&tx, &rubric.rid).await?;
        let follows = latest
            .as_ref()
            .is_some_and(|prev| rubric.revision == prev.revision + 1 && rubric.subrevision == 0);
        if !follows {
            return Err(out_of_sequence(rubric, latest.as_ref()));
        }
        insert_on(&tx, rubric).await?;

        let mut rows = tx
            .query(
                "SELECT DISTINCT t.id FROM tasks t
                 JOIN annotation_rubrics ar ON ar.annotation_id = t.latest_annotation
                 WHERE t.status = 'complete' AND ar.rid = ?1 AND ar.revision < ?2
                 ORDER BY t.paper_number, t.id",
                params![rubric.rid.to_string(), rubric.revision],
            )
            .await
            .map_err(db_err)?;
        let mut tagged: Vec<TaskId> = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            tagged.push(parsed(&row, 0)?);
        }
        drop(rows);
        for task in &tagged {
            add_tag_on(&tx, task, review_tag).await?;
        }
        tx.commit().await?;

        info!(
            rid = %rubric.rid,
            revision = rubric.revision,
            tagged = tagged.len(),
            "rubric revised"
        );
        Ok(MajorRevision {
            rubric: rubric.clone(),
            tagged,
        })
    }

    /// Newest snapshot of a rubric.
    pub async fn latest_rubric(&self, rid: &RubricId) -> Result<Option<Rubric>> {
        latest_on(self.conn(), rid).await
    }

    /// Newest subrevision within `revision`.
    pub async fn rubric_revision(&self, rid: &RubricId, revision: u32) -> Result<Option<Rubric>> {
        let sql = format!(
            "SELECT {RUBRIC_COLUMNS} FROM rubrics WHERE rid = ?1 AND revision = ?2
             ORDER BY subrevision DESC LIMIT 1"
        );
        Ok(rubrics_where(self.conn(), &sql, params![rid.to_string(), revision])
            .await?
            .into_iter()
            .next())
    }

    /// Every snapshot of a rubric, oldest first.
    pub async fn rubric_history(&self, rid: &RubricId) -> Result<Vec<Rubric>> {
        let sql = format!(
            "SELECT {RUBRIC_COLUMNS} FROM rubrics WHERE rid = ?1 ORDER BY revision, subrevision"
        );
        rubrics_where(self.conn(), &sql, params![rid.to_string()]).await
    }

    /// Latest snapshot of every rubric, optionally limited to one question.
    pub async fn list_rubrics(&self, question: Option<u32>) -> Result<Vec<Rubric>> {
        let sql = format!(
            "SELECT {RUBRIC_COLUMNS} FROM rubrics r
             WHERE (?1 IS NULL OR r.question = ?1)
               AND NOT EXISTS (
                 SELECT 1 FROM rubrics n WHERE n.rid = r.rid
                   AND (n.revision > r.revision
                        OR (n.revision = r.revision AND n.subrevision > r.subrevision)))
             ORDER BY r.question, r.created_at"
        );
        rubrics_where(self.conn(), &sql, params![question.map(i64::from)]).await
    }
}
