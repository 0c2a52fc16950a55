//! Assessment layout and the paper/question/version table.

use libsql::{Connection, params};
use scanmark_shared::{AssessmentLayout, PqvRow, PqvTable, Result, ScanmarkError};
use tracing::info;

use crate::Storage;
use crate::rows::{db_err, int, json, next, now_text, opt_int, to_json};

pub(crate) async fn layout_on(conn: &Connection) -> Result<Option<AssessmentLayout>> {
    let mut rows = conn
        .query("SELECT layout_json FROM assessment WHERE id = 1", params![])
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => Ok(Some(json(&row, 0)?)),
        None => Ok(None),
    }
}

pub(crate) async fn require_layout_on(conn: &Connection) -> Result<AssessmentLayout> {
    layout_on(conn)
        .await?
        .ok_or_else(|| ScanmarkError::validation("no assessment layout has been loaded"))
}

pub(crate) async fn pqv_row_on(conn: &Connection, paper: u32) -> Result<Option<PqvRow>> {
    let mut rows = conn
        .query(
            "SELECT id_version, versions_json FROM papers WHERE paper_number = ?1",
            params![paper],
        )
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => Ok(Some(PqvRow {
            id_version: opt_int(&row, 0),
            versions: json(&row, 1)?,
        })),
        None => Ok(None),
    }
}

/// Whether any image has ever been attached to `paper`.
///
/// Reads the paper's first-scan mark, so a page discarded later still counts.
pub(crate) async fn paper_has_scans_on(conn: &Connection, paper: u32) -> Result<bool> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM papers WHERE paper_number = ?1 AND first_scanned_at IS NOT NULL",
            params![paper],
        )
        .await
        .map_err(db_err)?;
    Ok(next(&mut rows).await?.is_some())
}

/// Record that an image now belongs to `paper`. The first mark is kept.
pub(crate) async fn mark_scanned_on(conn: &Connection, paper: u32) -> Result<()> {
    conn.execute(
        "UPDATE papers SET first_scanned_at = ?2
         WHERE paper_number = ?1 AND first_scanned_at IS NULL",
        params![paper, now_text()],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

impl Storage {
    /// Load the assessment layout.
    ///
    /// Replacing an existing layout is refused once papers are provisioned;
    /// loading the identical layout again is a no-op.
    pub async fn load_layout(&self, layout: &AssessmentLayout) -> Result<()> {
        layout.validate()?;
        let tx = self.begin_write().await?;

        if let Some(existing) = layout_on(&tx).await? {
            if &existing == layout {
                return Ok(());
            }
            let mut rows = tx
                .query("SELECT COUNT(*) FROM papers", params![])
                .await
                .map_err(db_err)?;
            let provisioned = match next(&mut rows).await? {
                Some(row) => int(&row, 0)?,
                None => 0,
            };
            if provisioned > 0 {
                return Err(ScanmarkError::validation(format!(
                    "assessment layout cannot be replaced: {provisioned} papers are provisioned"
                )));
            }
        }

        tx.execute(
            "INSERT INTO assessment (id, layout_json, loaded_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               layout_json = excluded.layout_json,
               loaded_at = excluded.loaded_at",
            params![to_json(layout)?, now_text()],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await?;

        info!(name = %layout.name, pages = layout.num_pages, questions = layout.question_count(), "assessment layout loaded");
        Ok(())
    }

    /// The loaded layout, if any.
    pub async fn layout(&self) -> Result<Option<AssessmentLayout>> {
        layout_on(self.conn()).await
    }

    /// The loaded layout, or a validation error.
    pub async fn require_layout(&self) -> Result<AssessmentLayout> {
        require_layout_on(self.conn()).await
    }

    /// Commit version rows, inserting new papers and replacing unchanged-or-unscanned ones.
    ///
    /// Validates every row before writing any. Each row must fit the loaded
    /// layout, and if a paper that has ever had a page scanned would change,
    /// nothing is written and [`ScanmarkError::PqvImmutable`] names the first
    /// such paper. Returns the number of rows written.
    pub async fn commit_pqv(&self, table: &PqvTable) -> Result<usize> {
        let tx = self.begin_write().await?;
        let layout = require_layout_on(&tx).await?;

        let mut changed = Vec::new();
        for (paper, row) in table.iter() {
            layout.check_pqv_row(paper, row)?;
            match pqv_row_on(&tx, paper).await? {
                Some(existing) if &existing == row => {}
                Some(_) => {
                    if paper_has_scans_on(&tx, paper).await? {
                        return Err(ScanmarkError::PqvImmutable { paper });
                    }
                    changed.push((paper, row));
                }
                None => changed.push((paper, row)),
            }
        }

        let now = now_text();
        for (paper, row) in &changed {
            tx.execute(
                "INSERT INTO papers (paper_number, id_version, versions_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(paper_number) DO UPDATE SET
                   id_version = excluded.id_version,
                   versions_json = excluded.versions_json",
                params![
                    *paper,
                    row.id_version.map(i64::from),
                    to_json(&row.versions)?,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await?;

        info!(rows = changed.len(), "version table committed");
        Ok(changed.len())
    }

    /// The full version table.
    pub async fn pqv_table(&self) -> Result<PqvTable> {
        let mut rows = self
            .conn()
            .query(
                "SELECT paper_number, id_version, versions_json FROM papers ORDER BY paper_number",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut table = PqvTable::new();
        while let Some(row) = next(&mut rows).await? {
            table.insert(
                int(&row, 0)?,
                PqvRow {
                    id_version: opt_int(&row, 1),
                    versions: json(&row, 2)?,
                },
            );
        }
        Ok(table)
    }

    /// Version row of one paper.
    pub async fn pqv_row(&self, paper: u32) -> Result<Option<PqvRow>> {
        pqv_row_on(self.conn(), paper).await
    }

    /// Whether any image has been attached to `paper`.
    pub async fn paper_has_scans(&self, paper: u32) -> Result<bool> {
        paper_has_scans_on(self.conn(), paper).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::tests::qr;
    use crate::test_support::{provisioned, small_layout, test_storage};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn layout_roundtrip_and_lock() {
        let storage = test_storage().await;
        assert!(storage.layout().await.unwrap().is_none());

        let layout = small_layout();
        storage.load_layout(&layout).await.unwrap();
        assert_eq!(storage.layout().await.unwrap(), Some(layout.clone()));

        let table: PqvTable = [(1, PqvRow::new(vec![1, 2, 1]))].into_iter().collect();
        storage.commit_pqv(&table).await.unwrap();

        // Same layout again is fine; a different one is not.
        storage.load_layout(&layout).await.unwrap();
        let mut other = layout;
        other.name = "other".into();
        assert_matches!(
            storage.load_layout(&other).await,
            Err(ScanmarkError::Validation { .. })
        );
    }

    #[tokio::test]
    async fn pqv_rows_persist() {
        let storage = provisioned(3).await;
        let table = storage.pqv_table().await.unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(storage.pqv_row(2).await.unwrap(), Some(PqvRow::new(vec![1, 1, 1])));
        assert_eq!(storage.pqv_row(9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rows_must_fit_the_layout() {
        let storage = provisioned(1).await;
        let bad: PqvTable = [
            (2, PqvRow::new(vec![1, 1, 1])),
            (3, PqvRow::new(vec![1, 3, 1])),
        ]
        .into_iter()
        .collect();
        assert_matches!(
            storage.commit_pqv(&bad).await,
            Err(ScanmarkError::Validation { .. })
        );
        assert_eq!(storage.pqv_row(2).await.unwrap(), None);

        let short: PqvTable = [(2, PqvRow::new(vec![1, 1]))].into_iter().collect();
        assert_matches!(
            storage.commit_pqv(&short).await,
            Err(ScanmarkError::Validation { .. })
        );
    }

    #[tokio::test]
    async fn discarding_a_scanned_page_keeps_the_row_fixed() {
        let storage = provisioned(1).await;
        let bundle = storage.register_bundle("b1", "h1").await.unwrap().bundle().id.clone();
        let page = storage
            .record_page(&bundle, 1, "img-a", &qr(1, 2))
            .await
            .unwrap();
        assert!(storage.paper_has_scans(1).await.unwrap());

        let changed: PqvTable = [(1, PqvRow::new(vec![2, 1, 1]))].into_iter().collect();
        assert_matches!(
            storage.commit_pqv(&changed).await,
            Err(ScanmarkError::PqvImmutable { paper: 1 })
        );

        storage.discard_page(&page.id, "smudged").await.unwrap();
        assert!(storage.paper_has_scans(1).await.unwrap());
        assert_matches!(
            storage.commit_pqv(&changed).await,
            Err(ScanmarkError::PqvImmutable { paper: 1 })
        );
        assert_eq!(storage.pqv_row(1).await.unwrap(), Some(PqvRow::new(vec![1, 1, 1])));
    }

    #[tokio::test]
    async fn unchanged_rows_are_not_rewritten() {
        let storage = provisioned(3).await;
        let table = storage.pqv_table().await.unwrap();
        assert_eq!(storage.commit_pqv(&table).await.unwrap(), 0);
    }
}
