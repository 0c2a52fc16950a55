//! Classification policy for incoming page images.
//!
//! The policy is a pure decision over what the store already holds; the
//! store applies it inside the same transaction that records the result.

use scanmark_shared::{ImageId, PageClassification, Result};

use crate::code::PageCode;

/// The image currently holding a `(paper, page)` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOccupant {
    pub image: ImageId,
    pub image_hash: String,
}

/// What to do with an incoming image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Record the image with this classification.
    Record(PageClassification),
    /// The same image already holds the slot; nothing new to index.
    Duplicate { existing: ImageId },
}

/// Decide the classification of an image.
///
/// - `decoded`: result of decoding the image's corner codes
/// - `image_hash`: content hash of the incoming image
/// - `expected_version`: version printed at the decoded slot according to
///   the version map, or `None` if the slot is not provisioned
/// - `occupant`: image currently holding the decoded slot
pub fn classify(
    decoded: &Result<PageCode>,
    image_hash: &str,
    expected_version: Option<u32>,
    occupant: Option<&SlotOccupant>,
) -> Verdict {
    let code = match decoded {
        Ok(code) => *code,
        Err(e) => {
            return Verdict::Record(PageClassification::Unknown {
                reason: e.to_string(),
            });
        }
    };

    let tpv = match code {
        PageCode::Scrap => {
            return Verdict::Record(PageClassification::Discarded {
                reason: "scrap page".into(),
            });
        }
        PageCode::Extra => {
            return Verdict::Record(PageClassification::Extra { assignment: None });
        }
        PageCode::Paper(tpv) => tpv,
    };

    match expected_version {
        None => {
            return Verdict::Record(PageClassification::Unknown {
                reason: format!("{tpv}: paper {} page {} is not provisioned", tpv.paper, tpv.page),
            });
        }
        Some(v) if v != tpv.version => {
            return Verdict::Record(PageClassification::Unknown {
                reason: format!("{tpv}: version map expects version {v}"),
            });
        }
        Some(_) => {}
    }

    match occupant {
        None => Verdict::Record(PageClassification::Known {
            paper: tpv.paper,
            page: tpv.page,
            version: tpv.version,
        }),
        Some(holder) if holder.image_hash == image_hash => Verdict::Duplicate {
            existing: holder.image.clone(),
        },
        Some(holder) => Verdict::Record(PageClassification::Collision {
            paper: tpv.paper,
            page: tpv.page,
            version: tpv.version,
            existing: holder.image.clone(),
        }),
    }
}
