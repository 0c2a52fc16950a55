//! Assessment layout and the paper→question→version table.
//!
//! The layout says which pages hold the ID box, do-not-mark material and
//! each question; the [`PqvTable`] says which source version every paper
//! uses per question. Together they determine the version printed on every
//! page of every paper.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanmarkError};

/// Largest page count expressible in a two-digit page code.
pub const MAX_PAGES: u32 = 99;

/// Largest version expressible in a one-digit page code.
pub const MAX_VERSIONS: u32 = 9;

/// Largest paper number expressible in a four-digit page code.
pub const MAX_PAPER: u32 = 9999;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// How a question's version is chosen per paper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectPolicy {
    /// Always version 1.
    Fixed,
    /// Spread uniformly over the allowed versions.
    #[default]
    Random,
}

/// One question of the assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionLayout {
    /// Display label, e.g. `Q1`.
    pub label: String,
    /// Pages (1-based) the question occupies.
    pub pages: Vec<u32>,
    /// Maximum mark.
    pub mark: u32,
    /// Version selection policy.
    #[serde(default)]
    pub select: SelectPolicy,
    /// Versions a random question may draw from. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<u32>,
}

/// What a physical page is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRole {
    Id,
    DoNotMark,
    Questions(Vec<u32>),
    /// Printed but not part of any group.
    Unowned,
}

/// Layout of an assessment, loaded once from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentLayout {
    /// Short name of the assessment.
    pub name: String,
    /// Five-digit code embedded in every page QR payload.
    pub public_code: String,
    /// Pages per paper.
    pub num_pages: u32,
    /// Number of source versions.
    pub num_versions: u32,
    /// Page holding the student ID box.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_page: Option<u32>,
    /// Pages nobody marks (formula sheets, instructions).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub do_not_mark_pages: Vec<u32>,
    /// Questions, numbered from 1 in order.
    pub questions: Vec<QuestionLayout>,
}

impl AssessmentLayout {
    /// Parse and validate a layout from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let layout: Self = toml::from_str(content)
            .map_err(|e| ScanmarkError::parse(format!("invalid assessment layout: {e}")))?;
        layout.validate()?;
        Ok(layout)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_pages == 0 || self.num_pages > MAX_PAGES {
            return Err(ScanmarkError::validation(format!(
                "num_pages must be in 1..={MAX_PAGES}, got {}",
                self.num_pages
            )));
        }
        if self.num_versions == 0 || self.num_versions > MAX_VERSIONS {
            return Err(ScanmarkError::validation(format!(
                "num_versions must be in 1..={MAX_VERSIONS}, got {}",
                self.num_versions
            )));
        }
        if self.public_code.len() != 5 || !self.public_code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ScanmarkError::validation(format!(
                "public_code must be exactly 5 digits, got {:?}",
                self.public_code
            )));
        }
        if self.questions.is_empty() {
            return Err(ScanmarkError::validation("at least one question is required"));
        }

        let in_range = |p: u32| p >= 1 && p <= self.num_pages;
        let mut reserved = BTreeSet::new();
        if let Some(id_page) = self.id_page {
            if !in_range(id_page) {
                return Err(ScanmarkError::validation(format!(
                    "id_page {id_page} is outside 1..={}",
                    self.num_pages
                )));
            }
            reserved.insert(id_page);
        }
        for &p in &self.do_not_mark_pages {
            if !in_range(p) {
                return Err(ScanmarkError::validation(format!(
                    "do-not-mark page {p} is outside 1..={}",
                    self.num_pages
                )));
            }
            if !reserved.insert(p) {
                return Err(ScanmarkError::validation(format!(
                    "page {p} is listed twice among id/do-not-mark pages"
                )));
            }
        }

        for (i, q) in self.questions.iter().enumerate() {
            let qnum = i + 1;
            if q.pages.is_empty() {
                return Err(ScanmarkError::validation(format!(
                    "question {qnum} ({}) has no pages",
                    q.label
                )));
            }
            for &p in &q.pages {
                if !in_range(p) {
                    return Err(ScanmarkError::validation(format!(
                        "question {qnum} page {p} is outside 1..={}",
                        self.num_pages
                    )));
                }
                if reserved.contains(&p) {
                    return Err(ScanmarkError::validation(format!(
                        "question {qnum} page {p} is also an id/do-not-mark page"
                    )));
                }
            }
            for &v in &q.versions {
                if v == 0 || v > self.num_versions {
                    return Err(ScanmarkError::validation(format!(
                        "question {qnum} allows version {v}, outside 1..={}",
                        self.num_versions
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of questions.
    pub fn question_count(&self) -> u32 {
        self.questions.len() as u32
    }

    /// Question by 1-based number.
    pub fn question(&self, question: u32) -> Option<&QuestionLayout> {
        let idx = usize::try_from(question).ok()?.checked_sub(1)?;
        self.questions.get(idx)
    }

    /// Questions (1-based) printed on `page`.
    pub fn questions_on_page(&self, page: u32) -> Vec<u32> {
        self.questions
            .iter()
            .enumerate()
            .filter(|(_, q)| q.pages.contains(&page))
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }

    /// What `page` is used for.
    pub fn page_role(&self, page: u32) -> PageRole {
        if self.id_page == Some(page) {
            return PageRole::Id;
        }
        if self.do_not_mark_pages.contains(&page) {
            return PageRole::DoNotMark;
        }
        let questions = self.questions_on_page(page);
        if questions.is_empty() {
            PageRole::Unowned
        } else {
            PageRole::Questions(questions)
        }
    }

    /// Version printed on `page` of a paper with version row `row`.
    pub fn page_version(&self, row: &PqvRow, page: u32) -> Option<u32> {
        if page == 0 || page > self.num_pages {
            return None;
        }
        match self.page_role(page) {
            PageRole::Id | PageRole::DoNotMark => Some(row.id_version.unwrap_or(1)),
            PageRole::Questions(qs) => row.version_of(qs[0]),
            PageRole::Unowned => Some(1),
        }
    }

    /// Questions grouped by shared physical pages (connected components).
    ///
    /// Every component must receive a single version on each paper.
    pub fn colocated_questions(&self) -> Vec<Vec<u32>> {
        let n = self.questions.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for page in 1..=self.num_pages {
            let on_page: Vec<usize> = self
                .questions_on_page(page)
                .into_iter()
                .map(|q| q as usize - 1)
                .collect();
            for pair in on_page.windows(2) {
                let (a, b) = (find(&mut parent, pair[0]), find(&mut parent, pair[1]));
                if a != b {
                    parent[b] = a;
                }
            }
        }

        let mut components: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        for q in 0..n {
            let root = find(&mut parent, q);
            components.entry(root).or_default().push(q as u32 + 1);
        }
        let mut out: Vec<Vec<u32>> = components.into_values().collect();
        out.sort();
        out
    }

    /// Versions a colocated component may take, ascending.
    ///
    /// A component holding a `fixed` question only takes version 1; any other
    /// takes the intersection of its questions' `versions` restrictions.
    pub fn allowed_versions(&self, component: &[u32]) -> Result<Vec<u32>> {
        let questions: Vec<_> = component.iter().filter_map(|q| self.question(*q)).collect();
        if questions.iter().any(|q| q.select == SelectPolicy::Fixed) {
            return Ok(vec![1]);
        }

        let mut allowed: BTreeSet<u32> = (1..=self.num_versions).collect();
        for q in &questions {
            if !q.versions.is_empty() {
                let restricted: BTreeSet<u32> = q.versions.iter().copied().collect();
                allowed = &allowed & &restricted;
            }
        }
        if allowed.is_empty() {
            return Err(ScanmarkError::validation(format!(
                "questions {component:?} share a page but have no version in common"
            )));
        }
        Ok(allowed.into_iter().collect())
    }

    /// Check one version row against this layout.
    pub fn check_pqv_row(&self, paper: u32, row: &PqvRow) -> Result<()> {
        if paper == 0 || paper > MAX_PAPER {
            return Err(ScanmarkError::validation(format!(
                "paper number {paper} is outside 1..={MAX_PAPER}"
            )));
        }
        if row.versions.len() != self.question_count() as usize {
            return Err(ScanmarkError::validation(format!(
                "paper {paper} has {} versions for {} questions",
                row.versions.len(),
                self.question_count()
            )));
        }
        if let Some(v) = row.id_version.filter(|v| *v == 0 || *v > self.num_versions) {
            return Err(ScanmarkError::validation(format!(
                "paper {paper}: id version {v} is outside 1..={}",
                self.num_versions
            )));
        }

        for component in self.colocated_questions() {
            let first = row.version_of(component[0]).unwrap_or(0);
            if let Some(q) = component.iter().find(|q| row.version_of(**q) != Some(first)) {
                return Err(ScanmarkError::validation(format!(
                    "paper {paper}: questions {} and {q} share a page but differ in version",
                    component[0]
                )));
            }
            if !self.allowed_versions(&component)?.contains(&first) {
                return Err(ScanmarkError::validation(format!(
                    "paper {paper}: version {first} is not allowed for question {}",
                    component[0]
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PQV table
// ---------------------------------------------------------------------------

/// Versions used by one paper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqvRow {
    /// Version of the ID and do-not-mark pages. `None` means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_version: Option<u32>,
    /// `versions[q - 1]` is the version of question `q`.
    pub versions: Vec<u32>,
}

impl PqvRow {
    /// Row with the given per-question versions.
    pub fn new(versions: Vec<u32>) -> Self {
        Self {
            id_version: None,
            versions,
        }
    }

    /// Version of 1-based question `question`.
    pub fn version_of(&self, question: u32) -> Option<u32> {
        let idx = usize::try_from(question).ok()?.checked_sub(1)?;
        self.versions.get(idx).copied()
    }
}

/// Paper number → version row, ordered by paper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PqvTable {
    rows: BTreeMap<u32, PqvRow>,
}

impl PqvTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a paper's row.
    pub fn insert(&mut self, paper: u32, row: PqvRow) {
        self.rows.insert(paper, row);
    }

    /// Row for `paper`.
    pub fn get(&self, paper: u32) -> Option<&PqvRow> {
        self.rows.get(&paper)
    }

    /// Whether `paper` is present.
    pub fn contains(&self, paper: u32) -> bool {
        self.rows.contains_key(&paper)
    }

    /// Paper numbers in ascending order.
    pub fn papers(&self) -> impl Iterator<Item = u32> + '_ {
        self.rows.keys().copied()
    }

    /// `(paper, row)` pairs in ascending paper order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &PqvRow)> {
        self.rows.iter().map(|(p, r)| (*p, r))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FromIterator<(u32, PqvRow)> for PqvTable {
    fn from_iter<I: IntoIterator<Item = (u32, PqvRow)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = r#"
name = "midterm"
public_code = "93849"
num_pages = 5
num_versions = 3

[[questions]]
label = "Q1"
pages = [1]
mark = 5

[[questions]]
label = "Q2"
pages = [2, 4]
mark = 10

[[questions]]
label = "Q3"
pages = [4, 5]
mark = 10
select = "fixed"
"#;

    #[test]
    fn parses_and_validates_layout() {
        let layout = AssessmentLayout::from_toml_str(LAYOUT).expect("parse layout");
        assert_eq!(layout.question_count(), 3);
        assert_eq!(layout.question(3).map(|q| q.select), Some(SelectPolicy::Fixed));
        assert_eq!(layout.question(2).map(|q| q.select), Some(SelectPolicy::Random));
        assert!(layout.question(0).is_none());
    }

    #[test]
    fn rows_are_checked_against_components() {
        let layout = AssessmentLayout::from_toml_str(LAYOUT).unwrap();
        assert_eq!(layout.allowed_versions(&[1]).unwrap(), vec![1, 2, 3]);
        assert_eq!(layout.allowed_versions(&[2, 3]).unwrap(), vec![1]);

        layout.check_pqv_row(4, &PqvRow::new(vec![3, 1, 1])).unwrap();
        for bad in [vec![4, 1, 1], vec![1, 2, 2], vec![1, 1], vec![1, 2, 1]] {
            assert!(layout.check_pqv_row(4, &PqvRow::new(bad)).is_err());
        }
        assert!(layout.check_pqv_row(0, &PqvRow::new(vec![1, 1, 1])).is_err());
    }

    #[test]
    fn page_roles_follow_layout() {
        let layout = AssessmentLayout::from_toml_str(LAYOUT).unwrap();
        assert_eq!(layout.page_role(1), PageRole::Questions(vec![1]));
        assert_eq!(layout.page_role(3), PageRole::Unowned);
        assert_eq!(layout.page_role(4), PageRole::Questions(vec![2, 3]));
    }

    #[test]
    fn colocated_questions_are_joined() {
        let layout = AssessmentLayout::from_toml_str(LAYOUT).unwrap();
        assert_eq!(layout.colocated_questions(), vec![vec![1], vec![2, 3]]);
    }

    #[test]
    fn page_versions_derive_from_row() {
        let layout = AssessmentLayout::from_toml_str(LAYOUT).unwrap();
        let row = PqvRow::new(vec![2, 3, 3]);
        assert_eq!(layout.page_version(&row, 1), Some(2));
        assert_eq!(layout.page_version(&row, 3), Some(1));
        assert_eq!(layout.page_version(&row, 5), Some(3));
        assert_eq!(layout.page_version(&row, 6), None);
    }

    #[test]
    fn rejects_overlapping_id_page() {
        let mut layout = AssessmentLayout::from_toml_str(LAYOUT).unwrap();
        layout.id_page = Some(2);
        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("also an id/do-not-mark page"));
    }

    #[test]
    fn rejects_bad_public_code() {
        let mut layout = AssessmentLayout::from_toml_str(LAYOUT).unwrap();
        layout.public_code = "12ab5".into();
        assert!(layout.validate().is_err());
    }

    #[test]
    fn pqv_table_orders_papers() {
        let table: PqvTable = [(3, PqvRow::new(vec![1])), (1, PqvRow::new(vec![2]))]
            .into_iter()
            .collect();
        assert_eq!(table.papers().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(table.get(1).and_then(|r| r.version_of(1)), Some(2));
    }
}
