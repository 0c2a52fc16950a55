//! Annotations, paper identities, ID predictions and derived paper status.

use libsql::{Connection, Row, params};
use scanmark_shared::{
    Annotation, IdPrediction, PaperIdentity, PaperStatus, Result, RubricRef, ScanmarkError,
    TaskId,
};

use crate::Storage;
use crate::assessment::{paper_has_scans_on, pqv_row_on, require_layout_on};
use crate::groups::groups_on;
use crate::rows::{count, db_err, flag, int, json, next, parsed, real, text, timestamp, ts_text};

const ANNOTATION_COLUMNS: &str = "id, task_id, paper_number, question, username, edition, score, \
     marking_time_secs, integrity_token, payload_json, discarded, created_at";

async fn rubric_refs_on(conn: &Connection, annotation: &str) -> Result<Vec<RubricRef>> {
    let mut rows = conn
        .query(
            "SELECT rid, revision FROM annotation_rubrics WHERE annotation_id = ?1 ORDER BY position",
            params![annotation],
        )
        .await
        .map_err(db_err)?;
    let mut out = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        out.push(RubricRef {
            rid: parsed(&row, 0)?,
            revision: int(&row, 1)?,
        });
    }
    Ok(out)
}

fn row_to_annotation(row: &Row) -> Result<Annotation> {
    Ok(Annotation {
        id: parsed(row, 0)?,
        task: parsed(row, 1)?,
        paper: int(row, 2)?,
        question: int(row, 3)?,
        username: text(row, 4)?,
        edition: int(row, 5)?,
        score: real(row, 6)?,
        marking_time_secs: real(row, 7)?,
        integrity_token: text(row, 8)?,
        rubrics: Vec::new(),
        payload: json(row, 9)?,
        discarded: flag(row, 10)?,
        created_at: timestamp(row, 11)?,
    })
}

async fn annotations_where(
    conn: &Connection,
    sql: &str,
    args: impl libsql::params::IntoParams,
) -> Result<Vec<Annotation>> {
    let mut rows = conn.query(sql, args).await.map_err(db_err)?;
    let mut out = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        out.push(row_to_annotation(&row)?);
    }
    drop(rows);
    for annotation in &mut out {
        annotation.rubrics = rubric_refs_on(conn, &annotation.id.to_string()).await?;
    }
    Ok(out)
}

fn row_to_identity(row: &Row) -> Result<PaperIdentity> {
    Ok(PaperIdentity {
        paper: int(row, 0)?,
        student_id: text(row, 1)?,
        student_name: text(row, 2)?,
        username: text(row, 3)?,
        created_at: timestamp(row, 4)?,
    })
}

impl Storage {
    /// Every edition for a paper and question, oldest first, discarded ones included.
    pub async fn annotations(&self, paper: u32, question: u32) -> Result<Vec<Annotation>> {
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE paper_number = ?1 AND question = ?2 ORDER BY edition"
        );
        annotations_where(self.conn(), &sql, params![paper, question]).await
    }

    /// The result currently backing a Complete mark task.
    pub async fn latest_annotation(&self, task: &TaskId) -> Result<Option<Annotation>> {
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE id = (SELECT latest_annotation FROM tasks WHERE id = ?1)"
        );
        Ok(annotations_where(self.conn(), &sql, params![task.to_string()])
            .await?
            .into_iter()
            .next())
    }

    pub async fn paper_identity(&self, paper: u32) -> Result<Option<PaperIdentity>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT paper_number, student_id, student_name, username, created_at
                 FROM paper_identities WHERE paper_number = ?1",
                params![paper],
            )
            .await
            .map_err(db_err)?;
        match next(&mut rows).await? {
            Some(row) => Ok(Some(row_to_identity(&row)?)),
            None => Ok(None),
        }
    }

    /// All identified papers, by paper number.
    pub async fn list_identities(&self) -> Result<Vec<PaperIdentity>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT paper_number, student_id, student_name, username, created_at
                 FROM paper_identities ORDER BY paper_number",
                params![],
            )
            .await
            .map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            out.push(row_to_identity(&row)?);
        }
        Ok(out)
    }

    /// Store a predictor's latest guess for a paper, replacing its previous one.
    pub async fn record_prediction(&self, prediction: &IdPrediction) -> Result<()> {
        if !(0.0..=1.0).contains(&prediction.certainty) {
            return Err(ScanmarkError::validation(format!(
                "certainty {} is outside 0..=1",
                prediction.certainty
            )));
        }
        let conn = self.lock_writes().await?;
        conn.execute(
            "INSERT INTO id_predictions (paper_number, predictor, student_id, certainty, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(paper_number, predictor) DO UPDATE SET
               student_id = excluded.student_id,
               certainty = excluded.certainty,
               created_at = excluded.created_at",
            params![
                prediction.paper,
                prediction.predictor.as_str(),
                prediction.student_id.as_str(),
                prediction.certainty,
                ts_text(&prediction.created_at)
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Predictions for a paper, most certain first.
    pub async fn predictions(&self, paper: u32) -> Result<Vec<IdPrediction>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT paper_number, predictor, student_id, certainty, created_at
                 FROM id_predictions WHERE paper_number = ?1 ORDER BY certainty DESC, predictor",
                params![paper],
            )
            .await
            .map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            out.push(IdPrediction {
                paper: int(&row, 0)?,
                predictor: text(&row, 1)?,
                student_id: text(&row, 2)?,
                certainty: real(&row, 3)?,
                created_at: timestamp(&row, 4)?,
            });
        }
        Ok(out)
    }

    /// Derived progress of a provisioned paper.
    pub async fn paper_status(&self, paper: u32) -> Result<PaperStatus> {
        let conn = self.conn();
        if pqv_row_on(conn, paper).await?.is_none() {
            return Err(ScanmarkError::not_found("paper", paper));
        }
        let layout = require_layout_on(conn).await?;
        let groups = groups_on(conn, paper).await?;

        let mut rows = conn
            .query(
                "SELECT COUNT(DISTINCT question) FROM tasks
                 WHERE paper_number = ?1 AND kind = 'mark' AND status = 'complete'",
                params![paper],
            )
            .await
            .map_err(db_err)?;
        let marked_questions = match next(&mut rows).await? {
            Some(row) => count(&row, 0)?,
            None => 0,
        };
        drop(rows);

        Ok(PaperStatus {
            paper,
            unused: !paper_has_scans_on(conn, paper).await?,
            scanned: !groups.is_empty() && groups.iter().all(|g| g.scanned),
            identified: self.paper_identity(paper).await?.is_some(),
            marked: marked_questions == u64::from(layout.question_count()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentifySubmission;
    use crate::groups::tests::scanned_paper;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use scanmark_shared::{MarkSubmission, TaskFilter, TaskKind, TaskStatus};

    #[tokio::test]
    async fn identify_and_status() {
        let storage = scanned_paper().await;
        let status = storage.paper_status(1).await.unwrap();
        assert!(status.scanned && !status.unused && !status.identified && !status.marked);
        assert!(storage.paper_status(2).await.unwrap().unused);
        assert_matches!(
            storage.paper_status(99).await,
            Err(ScanmarkError::NotFound { .. })
        );

        let tasks = storage.list_tasks(&TaskFilter::default()).await.unwrap();
        for task in &tasks {
            let lease = storage.claim_task(&task.id, "ann", None).await.unwrap();
            storage
                .complete_mark(
                    &task.id,
                    "ann",
                    &lease.integrity_token,
                    &MarkSubmission {
                        score: 1.0,
                        marking_time_secs: 3.0,
                        rubrics: vec![],
                        payload: serde_json::Value::Null,
                    },
                    None,
                )
                .await
                .unwrap();
        }
        assert!(storage.paper_status(1).await.unwrap().marked);

        let annotations = storage.annotations(1, 2).await.unwrap();
        assert_eq!(annotations.len(), 1);
        let latest = storage.latest_annotation(&tasks[1].id).await.unwrap().unwrap();
        assert_eq!(latest.question, 2);
        assert!(!latest.discarded);

        storage.reset_task(&tasks[1].id).await.unwrap();
        assert!(storage.annotations(1, 2).await.unwrap()[0].discarded);
        assert!(storage.latest_annotation(&tasks[1].id).await.unwrap().is_none());
        assert!(!storage.paper_status(1).await.unwrap().marked);

        // Identify completion is refused on a mark task.
        let err = storage
            .complete_identify(
                &tasks[0].id,
                "ann",
                "x",
                &IdentifySubmission {
                    student_id: "1234".into(),
                    student_name: "A".into(),
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, ScanmarkError::Validation { .. });
        assert_eq!(tasks[0].kind, TaskKind::Mark);
        assert_eq!(
            storage.task(&tasks[0].id).await.unwrap().status,
            TaskStatus::Complete
        );
    }

    #[tokio::test]
    async fn predictions_replace_per_predictor() {
        let storage = scanned_paper().await;
        let guess = |id: &str, certainty: f64| IdPrediction {
            paper: 1,
            predictor: "mlp".into(),
            student_id: id.into(),
            certainty,
            created_at: Utc::now(),
        };
        storage.record_prediction(&guess("111", 0.4)).await.unwrap();
        storage.record_prediction(&guess("222", 0.9)).await.unwrap();
        let predictions = storage.predictions(1).await.unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].student_id, "222");
        assert_matches!(
            storage.record_prediction(&guess("333", 1.5)).await,
            Err(ScanmarkError::Validation { .. })
        );
        assert!(storage.paper_identity(1).await.unwrap().is_none());
    }
}
