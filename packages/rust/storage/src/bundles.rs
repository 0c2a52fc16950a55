//! Bundles, page images and the administrative page actions.

use std::collections::BTreeSet;

use libsql::{Connection, Row, params};
use scanmark_codec::{SlotOccupant, Verdict, classify, decode_page};
use scanmark_shared::{
    AssessmentLayout, Bundle, BundleId, BundleStatus, BundleSummary, ExtraAssignment, ImageId,
    PageClassification, PageKind, Result, ScannedPage, ScanmarkError,
};
use tracing::{debug, info, warn};

use crate::Storage;
use crate::assessment::{mark_scanned_on, pqv_row_on, require_layout_on};
use crate::rows::{
    count, db_err, int, next, now_text, opt_int, opt_parsed, opt_text, opt_timestamp, parsed,
    text, timestamp, to_json,
};

const BUNDLE_COLUMNS: &str = "id, name, content_hash, status, error, created_at, pushed_at";

const PAGE_COLUMNS: &str = "id, bundle_id, bundle_order, image_hash, kind, paper_number, \
     page_number, version, questions_json, collides_with, reason, created_at";

/// Outcome of registering an upload.
#[derive(Debug, Clone)]
pub enum BundleRegistration {
    /// First upload of this file.
    New(Bundle),
    /// Same name and content as an existing bundle.
    Continuation(Bundle),
}

impl BundleRegistration {
    pub fn bundle(&self) -> &Bundle {
        match self {
            Self::New(b) | Self::Continuation(b) => b,
        }
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, Self::Continuation(_))
    }
}

/// Which image survives a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKeep {
    /// The quarantined image replaces the slot holder.
    Incoming,
    /// The slot holder stays; the quarantined image is discarded.
    Existing,
}

/// Manual disposition of an Unknown page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Known { paper: u32, page: u32 },
    Extra { paper: u32, questions: Vec<u32> },
    Discard,
}

/// Result of an administrative page action.
#[derive(Debug, Clone)]
pub struct PageAction {
    /// The page after the action.
    pub page: ScannedPage,
    /// Papers whose groups must be reassembled.
    pub papers: Vec<u32>,
}

fn row_to_bundle(row: &Row) -> Result<Bundle> {
    Ok(Bundle {
        id: parsed(row, 0)?,
        name: text(row, 1)?,
        content_hash: text(row, 2)?,
        status: parsed(row, 3)?,
        error: opt_text(row, 4),
        created_at: timestamp(row, 5)?,
        pushed_at: opt_timestamp(row, 6)?,
    })
}

fn row_to_page(row: &Row) -> Result<ScannedPage> {
    let kind: PageKind = parsed(row, 4)?;
    let paper = opt_int(row, 5);
    let page = opt_int(row, 6);
    let version = opt_int(row, 7);
    let missing = |what: &str| ScanmarkError::Storage(format!("{kind} image has no {what}"));

    let classification = match kind {
        PageKind::Known => PageClassification::Known {
            paper: paper.ok_or_else(|| missing("paper"))?,
            page: page.ok_or_else(|| missing("page"))?,
            version: version.ok_or_else(|| missing("version"))?,
        },
        PageKind::Extra => PageClassification::Extra {
            assignment: match paper {
                Some(paper) => {
                    let questions = match opt_text(row, 8) {
                        Some(raw) => serde_json::from_str(&raw)
                            .map_err(|e| ScanmarkError::Storage(e.to_string()))?,
                        None => Vec::new(),
                    };
                    Some(ExtraAssignment { paper, questions })
                }
                None => None,
            },
        },
        PageKind::Unknown => PageClassification::Unknown {
            reason: opt_text(row, 10).unwrap_or_default(),
        },
        PageKind::Collision => PageClassification::Collision {
            paper: paper.ok_or_else(|| missing("paper"))?,
            page: page.ok_or_else(|| missing("page"))?,
            version: version.ok_or_else(|| missing("version"))?,
            existing: opt_parsed(row, 9)?.ok_or_else(|| missing("slot holder"))?,
        },
        PageKind::Discarded => PageClassification::Discarded {
            reason: opt_text(row, 10).unwrap_or_default(),
        },
    };

    Ok(ScannedPage {
        id: parsed(row, 0)?,
        bundle_id: parsed(row, 1)?,
        bundle_order: int(row, 2)?,
        image_hash: text(row, 3)?,
        classification,
        created_at: timestamp(row, 11)?,
    })
}

/// Column values of a classification.
struct ClassColumns {
    kind: &'static str,
    paper: Option<i64>,
    page: Option<i64>,
    version: Option<i64>,
    questions_json: Option<String>,
    collides_with: Option<String>,
    reason: Option<String>,
}

impl ClassColumns {
    fn of(c: &PageClassification) -> Result<Self> {
        let mut cols = Self {
            kind: c.kind().as_str(),
            paper: None,
            page: None,
            version: None,
            questions_json: None,
            collides_with: None,
            reason: None,
        };
        match c {
            PageClassification::Known {
                paper,
                page,
                version,
            } => {
                cols.paper = Some(i64::from(*paper));
                cols.page = Some(i64::from(*page));
                cols.version = Some(i64::from(*version));
            }
            PageClassification::Extra { assignment } => {
                if let Some(a) = assignment {
                    cols.paper = Some(i64::from(a.paper));
                    cols.questions_json = Some(to_json(&a.questions)?);
                }
            }
            PageClassification::Collision {
                paper,
                page,
                version,
                existing,
            } => {
                cols.paper = Some(i64::from(*paper));
                cols.page = Some(i64::from(*page));
                cols.version = Some(i64::from(*version));
                cols.collides_with = Some(existing.to_string());
            }
            PageClassification::Unknown { reason } | PageClassification::Discarded { reason } => {
                cols.reason = Some(reason.clone());
            }
        }
        Ok(cols)
    }
}

pub(crate) async fn page_on(conn: &Connection, id: &ImageId) -> Result<ScannedPage> {
    let sql = format!("SELECT {PAGE_COLUMNS} FROM images WHERE id = ?1");
    let mut rows = conn
        .query(&sql, params![id.to_string()])
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => row_to_page(&row),
        None => Err(ScanmarkError::not_found("page", id)),
    }
}

/// Known and assigned Extra pages of pushed bundles that belong to `paper`,
/// in push order then bundle order.
pub(crate) async fn attached_pages_on(conn: &Connection, paper: u32) -> Result<Vec<ScannedPage>> {
    let mut rows = conn
        .query(
            "SELECT i.id, i.bundle_id, i.bundle_order, i.image_hash, i.kind, i.paper_number,
               i.page_number, i.version, i.questions_json, i.collides_with, i.reason, i.created_at
             FROM images i JOIN bundles b ON b.id = i.bundle_id
             WHERE b.status = 'pushed' AND i.paper_number = ?1 AND i.kind IN ('known', 'extra')
             ORDER BY b.pushed_at, b.created_at, i.bundle_order",
            params![paper],
        )
        .await
        .map_err(db_err)?;
    let mut out = Vec::new();
    while let Some(row) = next(&mut rows).await? {
        out.push(row_to_page(&row)?);
    }
    Ok(out)
}

async fn bundle_on(conn: &Connection, id: &BundleId) -> Result<Option<Bundle>> {
    let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE id = ?1");
    let mut rows = conn
        .query(&sql, params![id.to_string()])
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => Ok(Some(row_to_bundle(&row)?)),
        None => Ok(None),
    }
}

/// Image currently holding the Known slot `(paper, page)`.
async fn occupant_on(conn: &Connection, paper: u32, page: u32) -> Result<Option<SlotOccupant>> {
    let mut rows = conn
        .query(
            "SELECT id, image_hash FROM images
             WHERE kind = 'known' AND paper_number = ?1 AND page_number = ?2",
            params![paper, page],
        )
        .await
        .map_err(db_err)?;
    match next(&mut rows).await? {
        Some(row) => Ok(Some(SlotOccupant {
            image: parsed(&row, 0)?,
            image_hash: text(&row, 1)?,
        })),
        None => Ok(None),
    }
}

async fn set_classification_on(
    conn: &Connection,
    id: &ImageId,
    classification: &PageClassification,
) -> Result<()> {
    let cols = ClassColumns::of(classification)?;
    conn.execute(
        "UPDATE images SET kind = ?2, paper_number = ?3, page_number = ?4, version = ?5,
           questions_json = ?6, collides_with = ?7, reason = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            id.to_string(),
            cols.kind,
            cols.paper,
            cols.page,
            cols.version,
            cols.questions_json,
            cols.collides_with,
            cols.reason,
            now_text()
        ],
    )
    .await
    .map_err(db_err)?;
    if let Some(paper) = classification.paper() {
        mark_scanned_on(conn, paper).await?;
    }
    Ok(())
}

async fn summary_on(conn: &Connection, bundle: Bundle) -> Result<BundleSummary> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*),
               COALESCE(SUM(kind = 'known'), 0),
               COALESCE(SUM(kind = 'extra'), 0),
               COALESCE(SUM(kind = 'unknown'), 0),
               COALESCE(SUM(kind = 'collision'), 0),
               COALESCE(SUM(kind = 'discarded'), 0),
               COALESCE(SUM(kind = 'extra' AND paper_number IS NULL), 0)
             FROM images WHERE bundle_id = ?1",
            params![bundle.id.to_string()],
        )
        .await
        .map_err(db_err)?;
    let row = next(&mut rows)
        .await?
        .ok_or_else(|| ScanmarkError::Storage("empty aggregate".into()))?;
    Ok(BundleSummary {
        total: count(&row, 0)?,
        known: count(&row, 1)?,
        extra: count(&row, 2)?,
        unknown: count(&row, 3)?,
        collisions: count(&row, 4)?,
        discarded: count(&row, 5)?,
        unassigned_extra: count(&row, 6)?,
        bundle,
    })
}

/// Check an extra-page assignment against the layout and the provisioned papers.
async fn check_extra_target(
    conn: &Connection,
    layout: &AssessmentLayout,
    paper: u32,
    questions: &[u32],
) -> Result<()> {
    if pqv_row_on(conn, paper).await?.is_none() {
        return Err(ScanmarkError::not_found("paper", paper));
    }
    if questions.is_empty() {
        return Err(ScanmarkError::validation(
            "an extra page must be assigned to at least one question",
        ));
    }
    if let Some(q) = questions
        .iter()
        .find(|q| **q == 0 || **q > layout.question_count())
    {
        return Err(ScanmarkError::validation(format!(
            "question {q} is outside 1..={}",
            layout.question_count()
        )));
    }
    Ok(())
}

fn not_kind(page: &ScannedPage, wanted: &str) -> ScanmarkError {
    ScanmarkError::validation(format!(
        "page {} is {}, not {wanted}",
        page.id,
        page.classification.kind()
    ))
}

impl Storage {
    // -----------------------------------------------------------------------
    // Bundles
    // -----------------------------------------------------------------------

    /// Register an upload by name and content hash.
    ///
    /// Matching name and hash continues the existing bundle; a match on only
    /// one of the two is rejected.
    pub async fn register_bundle(&self, name: &str, content_hash: &str) -> Result<BundleRegistration> {
        let tx = self.begin_write().await?;

        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE name = ?1 OR content_hash = ?2");
        let mut rows = tx
            .query(&sql, params![name, content_hash])
            .await
            .map_err(db_err)?;
        let mut same_hash = None;
        while let Some(row) = next(&mut rows).await? {
            let existing = row_to_bundle(&row)?;
            if existing.name == name {
                if existing.content_hash == content_hash {
                    return Ok(BundleRegistration::Continuation(existing));
                }
                return Err(ScanmarkError::BundleNameHashMismatch {
                    name: name.to_string(),
                    existing_hash: existing.content_hash,
                    hash: content_hash.to_string(),
                });
            }
            same_hash = Some(existing);
        }
        drop(rows);
        if let Some(existing) = same_hash {
            return Err(ScanmarkError::DuplicateBundle {
                name: name.to_string(),
                existing_name: existing.name,
                hash: content_hash.to_string(),
            });
        }

        let bundle = Bundle {
            id: BundleId::new(),
            name: name.to_string(),
            content_hash: content_hash.to_string(),
            status: BundleStatus::Processing,
            error: None,
            created_at: chrono::Utc::now(),
            pushed_at: None,
        };
        tx.execute(
            "INSERT INTO bundles (id, name, content_hash, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bundle.id.to_string(),
                name,
                content_hash,
                bundle.status.as_str(),
                crate::rows::ts_text(&bundle.created_at)
            ],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await?;

        info!(bundle = %bundle.id, name, "bundle registered");
        Ok(BundleRegistration::New(bundle))
    }

    pub async fn bundle(&self, id: &BundleId) -> Result<Option<Bundle>> {
        bundle_on(self.conn(), id).await
    }

    /// All bundles, oldest first.
    pub async fn list_bundles(&self) -> Result<Vec<Bundle>> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles ORDER BY created_at, name");
        let mut rows = self.conn().query(&sql, params![]).await.map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            out.push(row_to_bundle(&row)?);
        }
        Ok(out)
    }

    /// Move a bundle to `status`, recording an error message for `Failed`.
    pub async fn set_bundle_status(
        &self,
        id: &BundleId,
        status: BundleStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_writes().await?;
        let changed = conn
            .execute(
                "UPDATE bundles SET status = ?2, error = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), error],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ScanmarkError::not_found("bundle", id));
        }
        Ok(())
    }

    /// Positions already extracted from a bundle.
    pub async fn recorded_orders(&self, id: &BundleId) -> Result<BTreeSet<u32>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT bundle_order FROM images WHERE bundle_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        let mut out = BTreeSet::new();
        while let Some(row) = next(&mut rows).await? {
            out.insert(int(&row, 0)?);
        }
        Ok(out)
    }

    pub async fn bundle_summary(&self, id: &BundleId) -> Result<BundleSummary> {
        let bundle = self
            .bundle(id)
            .await?
            .ok_or_else(|| ScanmarkError::not_found("bundle", id))?;
        summary_on(self.conn(), bundle).await
    }

    /// Mark a staged bundle pushed. Returns the papers it feeds.
    ///
    /// Fails with [`ScanmarkError::BundleNotReady`] while any page awaits
    /// manual disposition. Pushing an already-pushed bundle is a no-op.
    pub async fn push_bundle(&self, id: &BundleId) -> Result<Vec<u32>> {
        let tx = self.begin_write().await?;
        let bundle = bundle_on(&tx, id)
            .await?
            .ok_or_else(|| ScanmarkError::not_found("bundle", id))?;

        match bundle.status {
            BundleStatus::Pushed => return Ok(Vec::new()),
            BundleStatus::Processing | BundleStatus::Failed => {
                return Err(ScanmarkError::validation(format!(
                    "bundle {} is {}; only staged bundles can be pushed",
                    bundle.name, bundle.status
                )));
            }
            BundleStatus::Staged => {}
        }

        let summary = summary_on(&tx, bundle).await?;
        if !summary.is_ready_to_push() {
            return Err(ScanmarkError::BundleNotReady {
                bundle: summary.bundle.name,
                unknown: summary.unknown,
                collisions: summary.collisions,
                unassigned_extra: summary.unassigned_extra,
            });
        }

        tx.execute(
            "UPDATE bundles SET status = 'pushed', pushed_at = ?2 WHERE id = ?1",
            params![id.to_string(), now_text()],
        )
        .await
        .map_err(db_err)?;

        let mut rows = tx
            .query(
                "SELECT DISTINCT paper_number FROM images
                 WHERE bundle_id = ?1 AND paper_number IS NOT NULL AND kind IN ('known', 'extra')
                 ORDER BY paper_number",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        let mut papers = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            papers.push(int(&row, 0)?);
        }
        drop(rows);
        tx.commit().await?;

        info!(bundle = %id, name = %summary.bundle.name, papers = papers.len(), "bundle pushed");
        Ok(papers)
    }

    // -----------------------------------------------------------------------
    // Pages
    // -----------------------------------------------------------------------

    /// Classify and record the image at `bundle_order`.
    ///
    /// `raw_codes` are the corner payloads read from the image. A position
    /// that is already recorded is returned unchanged.
    pub async fn record_page(
        &self,
        bundle: &BundleId,
        bundle_order: u32,
        image_hash: &str,
        raw_codes: &[String],
    ) -> Result<ScannedPage> {
        let tx = self.begin_write().await?;

        let sql = format!("SELECT {PAGE_COLUMNS} FROM images WHERE bundle_id = ?1 AND bundle_order = ?2");
        let mut rows = tx
            .query(&sql, params![bundle.to_string(), bundle_order])
            .await
            .map_err(db_err)?;
        if let Some(row) = next(&mut rows).await? {
            return row_to_page(&row);
        }
        drop(rows);

        let layout = require_layout_on(&tx).await?;
        let decoded = decode_page(raw_codes, &layout.public_code);

        let (expected_version, occupant) = match &decoded {
            Ok(scanmark_codec::PageCode::Paper(tpv)) => {
                let expected = pqv_row_on(&tx, tpv.paper)
                    .await?
                    .and_then(|row| layout.page_version(&row, tpv.page));
                (expected, occupant_on(&tx, tpv.paper, tpv.page).await?)
            }
            _ => (None, None),
        };

        let classification = match classify(&decoded, image_hash, expected_version, occupant.as_ref()) {
            Verdict::Record(c) => c,
            Verdict::Duplicate { existing } => PageClassification::Discarded {
                reason: format!("duplicate of {existing}"),
            },
        };

        let page = ScannedPage {
            id: ImageId::new(),
            bundle_id: bundle.clone(),
            bundle_order,
            image_hash: image_hash.to_string(),
            classification,
            created_at: chrono::Utc::now(),
        };
        let cols = ClassColumns::of(&page.classification)?;
        let created = crate::rows::ts_text(&page.created_at);
        tx.execute(
            "INSERT INTO images (id, bundle_id, bundle_order, image_hash, raw_codes_json, kind,
               paper_number, page_number, version, questions_json, collides_with, reason,
               created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                page.id.to_string(),
                bundle.to_string(),
                bundle_order,
                image_hash,
                to_json(raw_codes)?,
                cols.kind,
                cols.paper,
                cols.page,
                cols.version,
                cols.questions_json,
                cols.collides_with,
                cols.reason,
                created
            ],
        )
        .await
        .map_err(db_err)?;
        if let Some(paper) = page.classification.paper() {
            mark_scanned_on(&tx, paper).await?;
        }
        tx.commit().await?;

        match &page.classification {
            PageClassification::Collision {
                paper,
                page: p,
                existing,
                ..
            } => warn!(image = %page.id, paper, page = p, %existing, "collision quarantined"),
            PageClassification::Unknown { reason } => {
                warn!(image = %page.id, bundle_order, %reason, "unknown page")
            }
            other => debug!(image = %page.id, bundle_order, kind = %other.kind(), "page classified"),
        }
        Ok(page)
    }

    pub async fn page(&self, id: &ImageId) -> Result<ScannedPage> {
        page_on(self.conn(), id).await
    }

    /// Pages of a bundle in bundle order.
    pub async fn bundle_pages(&self, id: &BundleId) -> Result<Vec<ScannedPage>> {
        let sql = format!("SELECT {PAGE_COLUMNS} FROM images WHERE bundle_id = ?1 ORDER BY bundle_order");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            out.push(row_to_page(&row)?);
        }
        Ok(out)
    }

    /// Unknown, Collision and unassigned Extra pages, in bundle order.
    pub async fn pages_needing_review(&self, id: &BundleId) -> Result<Vec<ScannedPage>> {
        Ok(self
            .bundle_pages(id)
            .await?
            .into_iter()
            .filter(|p| p.classification.needs_review())
            .collect())
    }

    /// Take a page out of consideration.
    pub async fn discard_page(&self, id: &ImageId, reason: &str) -> Result<PageAction> {
        let tx = self.begin_write().await?;
        let page = page_on(&tx, id).await?;
        if page.classification.kind() == PageKind::Discarded {
            return Ok(PageAction {
                page,
                papers: Vec::new(),
            });
        }

        let papers = page.classification.paper().into_iter().collect();
        let classification = PageClassification::Discarded {
            reason: reason.to_string(),
        };
        set_classification_on(&tx, id, &classification).await?;
        tx.commit().await?;

        info!(image = %id, previous = %page.classification.kind(), "page discarded");
        Ok(PageAction {
            page: ScannedPage {
                classification,
                ..page
            },
            papers,
        })
    }

    /// Settle a collision by keeping exactly one of the two images.
    pub async fn resolve_collision(&self, id: &ImageId, keep: CollisionKeep) -> Result<PageAction> {
        let tx = self.begin_write().await?;
        let page = page_on(&tx, id).await?;
        let PageClassification::Collision {
            paper,
            page: page_number,
            version,
            existing,
        } = page.classification.clone()
        else {
            return Err(not_kind(&page, "a collision"));
        };

        let classification = match keep {
            CollisionKeep::Existing => PageClassification::Discarded {
                reason: format!("collision resolved: kept {existing}"),
            },
            CollisionKeep::Incoming => {
                if let Some(holder) = occupant_on(&tx, paper, page_number).await? {
                    set_classification_on(
                        &tx,
                        &holder.image,
                        &PageClassification::Discarded {
                            reason: format!("collision resolved: replaced by {id}"),
                        },
                    )
                    .await?;
                    // Other images still quarantined at this slot now collide
                    // with the kept one.
                    tx.execute(
                        "UPDATE images SET collides_with = ?2, updated_at = ?3
                         WHERE kind = 'collision' AND collides_with = ?1 AND id != ?2",
                        params![holder.image.to_string(), id.to_string(), now_text()],
                    )
                    .await
                    .map_err(db_err)?;
                }
                PageClassification::Known {
                    paper,
                    page: page_number,
                    version,
                }
            }
        };
        set_classification_on(&tx, id, &classification).await?;
        tx.commit().await?;

        info!(image = %id, paper, page = page_number, ?keep, "collision resolved");
        Ok(PageAction {
            page: ScannedPage {
                classification,
                ..page
            },
            papers: vec![paper],
        })
    }

    /// Manually classify an Unknown page.
    pub async fn dispose_unknown(&self, id: &ImageId, disposition: Disposition) -> Result<PageAction> {
        let tx = self.begin_write().await?;
        let page = page_on(&tx, id).await?;
        if page.classification.kind() != PageKind::Unknown {
            return Err(not_kind(&page, "unknown"));
        }
        let layout = require_layout_on(&tx).await?;

        let classification = match disposition {
            Disposition::Known {
                paper,
                page: page_number,
            } => {
                let row = pqv_row_on(&tx, paper)
                    .await?
                    .ok_or_else(|| ScanmarkError::not_found("paper", paper))?;
                let version = layout.page_version(&row, page_number).ok_or_else(|| {
                    ScanmarkError::validation(format!(
                        "page {page_number} is outside 1..={}",
                        layout.num_pages
                    ))
                })?;
                if let Some(holder) = occupant_on(&tx, paper, page_number).await? {
                    return Err(ScanmarkError::Collision {
                        paper,
                        page: page_number,
                        image: holder.image.to_string(),
                    });
                }
                PageClassification::Known {
                    paper,
                    page: page_number,
                    version,
                }
            }
            Disposition::Extra { paper, questions } => {
                check_extra_target(&tx, &layout, paper, &questions).await?;
                PageClassification::Extra {
                    assignment: Some(ExtraAssignment { paper, questions }),
                }
            }
            Disposition::Discard => PageClassification::Discarded {
                reason: "discarded during review".into(),
            },
        };
        set_classification_on(&tx, id, &classification).await?;
        tx.commit().await?;

        info!(image = %id, kind = %classification.kind(), "unknown page disposed");
        let papers = classification.paper().into_iter().collect();
        Ok(PageAction {
            page: ScannedPage {
                classification,
                ..page
            },
            papers,
        })
    }

    /// Attach an Extra page to a paper and questions (or move it).
    pub async fn assign_extra(&self, id: &ImageId, paper: u32, questions: Vec<u32>) -> Result<PageAction> {
        let tx = self.begin_write().await?;
        let page = page_on(&tx, id).await?;
        let PageClassification::Extra { assignment } = &page.classification else {
            return Err(not_kind(&page, "extra"));
        };
        let layout = require_layout_on(&tx).await?;
        check_extra_target(&tx, &layout, paper, &questions).await?;

        let mut papers: Vec<u32> = assignment.iter().map(|a| a.paper).collect();
        if !papers.contains(&paper) {
            papers.push(paper);
        }
        let classification = PageClassification::Extra {
            assignment: Some(ExtraAssignment { paper, questions }),
        };
        set_classification_on(&tx, id, &classification).await?;
        tx.commit().await?;

        info!(image = %id, paper, "extra page assigned");
        Ok(PageAction {
            page: ScannedPage {
                classification,
                ..page
            },
            papers,
        })
    }
}
