//! Fixtures shared by the unit tests of this crate.

use uuid::Uuid;

use scanmark_codec::{Corner, PageCode, Tpv, encode};
use scanmark_shared::{
    AssessmentLayout, BundleId, BundleStatus, Caller, PqvRow, PqvTable, Role,
};
use scanmark_storage::{GroupDelta, Storage};

use crate::ingest::sha256_hex;

pub const PUBLIC_CODE: &str = "93849";

/// Five pages, id on page 1, three questions, two versions.
pub fn small_layout() -> AssessmentLayout {
    AssessmentLayout::from_toml_str(
        r#"
        name = "quiz"
        public_code = "93849"
        num_pages = 5
        num_versions = 2
        id_page = 1

        [[questions]]
        label = "Q1"
        pages = [2]
        mark = 5

        [[questions]]
        label = "Q2"
        pages = [3, 4]
        mark = 10

        [[questions]]
        label = "Q3"
        pages = [5]
        mark = 4
        "#,
    )
    .expect("layout")
}

pub async fn storage_with(layout: &AssessmentLayout, table: &PqvTable) -> Storage {
    let path = std::env::temp_dir().join(format!("scanmark_core_test_{}.db", Uuid::now_v7()));
    let storage = Storage::open(&path).await.expect("open test db");
    storage.load_layout(layout).await.expect("layout");
    storage.commit_pqv(table).await.expect("pqv");
    storage
}

/// [`small_layout`] with papers `1..=n`, every question at version 1.
pub async fn small_storage(n: u32) -> Storage {
    let table: PqvTable = (1..=n).map(|p| (p, PqvRow::new(vec![1, 1, 1]))).collect();
    storage_with(&small_layout(), &table).await
}

/// North-east and south-west payloads of a page.
pub fn qr(paper: u32, page: u32, version: u32) -> Vec<String> {
    let code = PageCode::Paper(Tpv::new(paper, page, version).expect("valid code"));
    [Corner::NorthEast, Corner::SouthWest]
        .into_iter()
        .map(|corner| encode(code, corner, PUBLIC_CODE).expect("encode"))
        .collect()
}

pub fn manager() -> Caller {
    Caller::new("boss", Role::Manager)
}

pub fn marker(name: &str) -> Caller {
    Caller::new(name, Role::Marker)
}

/// Record `(image, payloads)` in order and stage the bundle.
pub async fn staged_bundle(
    storage: &Storage,
    name: &str,
    scans: &[(String, Vec<String>)],
) -> BundleId {
    let registration = storage
        .register_bundle(name, &sha256_hex(name.as_bytes()))
        .await
        .expect("register");
    let bundle = registration.bundle().id.clone();
    for (i, (image, payloads)) in scans.iter().enumerate() {
        storage
            .record_page(&bundle, i as u32 + 1, &sha256_hex(image.as_bytes()), payloads)
            .await
            .expect("record page");
    }
    storage
        .set_bundle_status(&bundle, BundleStatus::Staged, None)
        .await
        .expect("stage");
    bundle
}

pub async fn push_all(storage: &Storage, bundle: &BundleId) -> Vec<GroupDelta> {
    crate::review::push(storage, &manager(), bundle)
        .await
        .expect("push")
        .deltas
}

/// Scan and push every page of `papers` (all at version 1).
pub async fn scanned_papers(storage: &Storage, name: &str, papers: &[u32]) {
    let scans: Vec<(String, Vec<String>)> = papers
        .iter()
        .flat_map(|&paper| (1..=5).map(move |page| (format!("{paper}/{page}"), qr(paper, page, 1))))
        .collect();
    let bundle = staged_bundle(storage, name, &scans).await;
    push_all(storage, &bundle).await;
}
