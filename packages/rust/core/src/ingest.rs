//! Bundle ingestion: hash, register, then classify in the background.
//!
//! [`ingest`] returns as soon as the bundle is registered. Classification
//! runs on a spawned task; callers poll [`Storage::bundle_summary`] or await
//! the ticket's job handle.

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use scanmark_shared::{
    BundleId, BundleStatus, BundleSummary, PageKind, Result, ScanmarkError, ScanningConfig,
};
use scanmark_storage::Storage;

/// One page image and the corner payloads read from it.
#[derive(Debug, Clone)]
pub struct PageScan {
    pub image: Vec<u8>,
    pub qr: Vec<String>,
}

/// An uploaded scan file, already split into page images.
#[derive(Debug, Clone)]
pub struct BundleUpload {
    pub name: String,
    /// Bytes of the uploaded file, hashed to identify the bundle.
    pub file: Vec<u8>,
    /// Pages in bundle order.
    pub pages: Vec<PageScan>,
}

/// Accepted upload. Classification may still be running.
#[derive(Debug)]
pub struct IngestTicket {
    pub bundle: BundleId,
    /// The same name and content were uploaded before.
    pub continuation: bool,
    pub job: JoinHandle<Result<BundleSummary>>,
}

/// Progress callback for the classification job.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each page is recorded.
    fn page_classified(&self, order: u32, total: usize, kind: PageKind);
    /// Called when the bundle is staged.
    fn done(&self, summary: &BundleSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_classified(&self, _order: u32, _total: usize, _kind: PageKind) {}
    fn done(&self, _summary: &BundleSummary) {}
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Register `upload` and spawn its classification job.
///
/// Re-uploading the same name and content continues the existing bundle:
/// only positions not yet recorded are classified.
#[instrument(skip_all, fields(name = %upload.name, pages = upload.pages.len()))]
pub async fn ingest(
    storage: Arc<Storage>,
    upload: BundleUpload,
    scanning: &ScanningConfig,
    progress: Arc<dyn ProgressReporter>,
) -> Result<IngestTicket> {
    let content_hash = sha256_hex(&upload.file);
    let registration = storage.register_bundle(&upload.name, &content_hash).await?;
    let bundle = registration.bundle().clone();
    let continuation = registration.is_continuation();

    info!(bundle = %bundle.id, continuation, status = %bundle.status, "upload accepted");

    let concurrency = scanning.classify_concurrency.max(1) as usize;
    let span = info_span!("classify", bundle = %bundle.id);
    let job = {
        let bundle_id = bundle.id.clone();
        tokio::spawn(
            async move {
                let outcome =
                    classify_bundle(&storage, &bundle_id, upload.pages, concurrency, &*progress)
                        .await;
                match outcome {
                    Ok(summary) => {
                        progress.done(&summary);
                        Ok(summary)
                    }
                    Err(e) => {
                        error!(error = %e, "classification failed");
                        if let Err(mark) = storage
                            .set_bundle_status(&bundle_id, BundleStatus::Failed, Some(&e.to_string()))
                            .await
                        {
                            warn!(error = %mark, "could not mark bundle failed");
                        }
                        Err(e)
                    }
                }
            }
            .instrument(span),
        )
    };

    Ok(IngestTicket {
        bundle: bundle.id,
        continuation,
        job,
    })
}

/// Hash images in batches of `concurrency`, then record every position
/// not yet stored, in bundle order.
async fn classify_bundle(
    storage: &Storage,
    bundle: &BundleId,
    pages: Vec<PageScan>,
    concurrency: usize,
    progress: &dyn ProgressReporter,
) -> Result<BundleSummary> {
    let start = Instant::now();
    let current = storage
        .bundle(bundle)
        .await?
        .ok_or_else(|| ScanmarkError::not_found("bundle", bundle))?;
    if current.status == BundleStatus::Pushed {
        debug!("bundle already pushed; nothing to classify");
        return storage.bundle_summary(bundle).await;
    }

    let recorded = storage.recorded_orders(bundle).await?;
    let total = pages.len();
    let mut pending: Vec<(u32, PageScan)> = pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| (i as u32 + 1, page))
        .filter(|(order, _)| !recorded.contains(order))
        .collect();

    if !pending.is_empty() {
        storage
            .set_bundle_status(bundle, BundleStatus::Processing, None)
            .await?;
    }
    progress.phase("Classifying pages");

    while !pending.is_empty() {
        let batch: Vec<(u32, PageScan)> = {
            let take = pending.len().min(concurrency);
            pending.drain(..take).collect()
        };

        let mut handles = Vec::new();
        for (order, page) in batch {
            handles.push(tokio::task::spawn_blocking(move || {
                let hash = sha256_hex(&page.image);
                (order, hash, page.qr)
            }));
        }

        for handle in handles {
            let (order, hash, qr) = handle
                .await
                .map_err(|e| ScanmarkError::Storage(format!("hashing task failed: {e}")))?;
            let page = storage.record_page(bundle, order, &hash, &qr).await?;
            progress.page_classified(order, total, page.classification.kind());
        }
    }

    storage
        .set_bundle_status(bundle, BundleStatus::Staged, None)
        .await?;
    let summary = storage.bundle_summary(bundle).await?;

    info!(
        known = summary.known,
        extra = summary.extra,
        unknown = summary.unknown,
        collisions = summary.collisions,
        elapsed_ms = start.elapsed().as_millis(),
        "bundle staged"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{qr, small_storage};
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    fn upload(name: &str, file: &[u8], pages: &[(u32, u32)]) -> BundleUpload {
        BundleUpload {
            name: name.into(),
            file: file.to_vec(),
            pages: pages
                .iter()
                .map(|(paper, page)| PageScan {
                    image: format!("image {paper}/{page}").into_bytes(),
                    qr: qr(*paper, *page, 1),
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u32, PageKind)>>);

    impl ProgressReporter for Recorder {
        fn phase(&self, _name: &str) {}
        fn page_classified(&self, order: u32, _total: usize, kind: PageKind) {
            self.0.lock().unwrap().push((order, kind));
        }
        fn done(&self, _summary: &BundleSummary) {}
    }

    #[tokio::test]
    async fn ingest_classifies_in_background() {
        let storage = Arc::new(small_storage(2).await);
        let recorder = Arc::new(Recorder::default());
        let ticket = ingest(
            Arc::clone(&storage),
            upload("b1", b"scan-1", &[(1, 1), (1, 2), (2, 9)]),
            &ScanningConfig::default(),
            recorder.clone(),
        )
        .await
        .unwrap();
        assert!(!ticket.continuation);

        let summary = ticket.job.await.unwrap().unwrap();
        assert_eq!(summary.bundle.status, BundleStatus::Staged);
        assert_eq!((summary.total, summary.known, summary.unknown), (3, 2, 1));
        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen.iter().map(|(o, _)| *o).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(seen[2].1, PageKind::Unknown);
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let storage = Arc::new(small_storage(2).await);
        let first = ingest(
            Arc::clone(&storage),
            upload("b1", b"scan-1", &[(1, 1), (1, 2)]),
            &ScanningConfig::default(),
            Arc::new(SilentProgress),
        )
        .await
        .unwrap();
        let first_summary = first.job.await.unwrap().unwrap();

        let again = ingest(
            Arc::clone(&storage),
            upload("b1", b"scan-1", &[(1, 1), (1, 2)]),
            &ScanningConfig::default(),
            Arc::new(SilentProgress),
        )
        .await
        .unwrap();
        assert!(again.continuation);
        assert_eq!(again.bundle, first.bundle);
        let summary = again.job.await.unwrap().unwrap();
        assert_eq!(summary.total, first_summary.total);
        assert_eq!(summary.collisions, 0);
        assert_eq!(storage.list_bundles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_uploads_are_rejected() {
        let storage = Arc::new(small_storage(1).await);
        let ticket = ingest(
            Arc::clone(&storage),
            upload("b1", b"scan-1", &[(1, 1)]),
            &ScanningConfig::default(),
            Arc::new(SilentProgress),
        )
        .await
        .unwrap();
        ticket.job.await.unwrap().unwrap();

        assert_matches!(
            ingest(
                Arc::clone(&storage),
                upload("b1", b"scan-2", &[]),
                &ScanningConfig::default(),
                Arc::new(SilentProgress),
            )
            .await,
            Err(ScanmarkError::BundleNameHashMismatch { .. })
        );
        assert_matches!(
            ingest(
                Arc::clone(&storage),
                upload("b2", b"scan-1", &[]),
                &ScanningConfig::default(),
                Arc::new(SilentProgress),
            )
            .await,
            Err(ScanmarkError::DuplicateBundle { .. })
        );
    }
}
