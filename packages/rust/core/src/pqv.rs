//! PQV mapper: build, extend, validate and exchange the version table.
//!
//! Questions that share a physical page form one component and always
//! receive one version per paper. A component containing a `fixed`
//! question is pinned to version 1; every other component draws from the
//! intersection of its questions' allowed versions, balanced so that
//! realized counts differ by at most one across papers.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use tracing::{info, instrument};

use scanmark_shared::{AssessmentLayout, MAX_PAPER, PqvRow, PqvTable, Result, ScanmarkError};

const PAPER_COLUMN: &str = "paper_number";
const ID_COLUMN: &str = "id.version";

/// `count` draws from `allowed`, each value appearing `count / k` or
/// `count / k + 1` times, in shuffled order. The values that get the extra
/// draw are picked at random.
fn balanced_draws(allowed: &[u32], count: usize, rng: &mut StdRng) -> Vec<u32> {
    let leftover = count % allowed.len();
    let mut draws: Vec<u32> = allowed
        .iter()
        .copied()
        .cycle()
        .take(count - leftover)
        .collect();
    draws.extend(allowed.choose_multiple(rng, leftover).copied());
    draws.shuffle(rng);
    draws
}

/// Build a table for papers `1..=papers`.
///
/// The same `seed` always yields the same table.
#[instrument(skip(layout))]
pub fn build(layout: &AssessmentLayout, papers: u32, seed: Option<u64>) -> Result<PqvTable> {
    if papers == 0 || papers > MAX_PAPER {
        return Err(ScanmarkError::validation(format!(
            "paper count {papers} is outside 1..={MAX_PAPER}"
        )));
    }
    let seed = seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);

    let count = papers as usize;
    let mut columns = vec![vec![1u32; count]; layout.question_count() as usize];
    for component in layout.colocated_questions() {
        let allowed = layout.allowed_versions(&component)?;
        let draws = balanced_draws(&allowed, count, &mut rng);
        for q in &component {
            columns[*q as usize - 1] = draws.clone();
        }
    }

    let table: PqvTable = (0..count)
        .map(|i| {
            let versions = columns.iter().map(|col| col[i]).collect();
            (i as u32 + 1, PqvRow::new(versions))
        })
        .collect();

    info!(papers, seed, "version table built");
    Ok(table)
}

/// Extend `table` with `papers`, each copying the row of `template`.
pub fn append(table: &PqvTable, papers: &[u32], template: u32) -> Result<PqvTable> {
    let row = table
        .get(template)
        .cloned()
        .ok_or_else(|| ScanmarkError::not_found("template paper", template))?;

    let mut extended = table.clone();
    for &paper in papers {
        if paper == 0 || paper > MAX_PAPER {
            return Err(ScanmarkError::validation(format!(
                "paper number {paper} is outside 1..={MAX_PAPER}"
            )));
        }
        if extended.contains(paper) {
            return Err(ScanmarkError::validation(format!(
                "paper {paper} is already in the version table"
            )));
        }
        extended.insert(paper, row.clone());
    }
    Ok(extended)
}

/// Check every row against the layout's constraints.
pub fn validate(layout: &AssessmentLayout, table: &PqvTable) -> Result<()> {
    table
        .iter()
        .try_for_each(|(paper, row)| layout.check_pqv_row(paper, row))
}

/// Render the table as CSV with a `paper_number, q1.version, …, id.version` header.
pub fn to_csv(layout: &AssessmentLayout, table: &PqvTable) -> String {
    let mut header = vec![PAPER_COLUMN.to_string()];
    header.extend((1..=layout.question_count()).map(|q| format!("q{q}.version")));
    header.push(ID_COLUMN.to_string());

    let mut out = header.join(",");
    out.push('\n');
    for (paper, row) in table.iter() {
        let mut cells = vec![paper.to_string()];
        cells.extend(row.versions.iter().map(u32::to_string));
        cells.push(row.id_version.map(|v| v.to_string()).unwrap_or_default());
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn parse_cell(value: &str, line: usize, column: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| {
        ScanmarkError::parse(format!("line {line}: {column} {value:?} is not a number"))
    })
}

/// Parse CSV produced by [`to_csv`]. Column order is free; `id.version` is optional.
pub fn from_csv(layout: &AssessmentLayout, text: &str) -> Result<PqvTable> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());
    let (_, header) = lines
        .next()
        .ok_or_else(|| ScanmarkError::parse("empty version table"))?;
    let header: Vec<&str> = header.split(',').map(str::trim).collect();

    let position = |name: &str| header.iter().position(|h| *h == name);
    let paper_col = position(PAPER_COLUMN)
        .ok_or_else(|| ScanmarkError::parse(format!("missing column {PAPER_COLUMN}")))?;
    let question_cols = (1..=layout.question_count())
        .map(|q| {
            let name = format!("q{q}.version");
            position(&name).ok_or_else(|| ScanmarkError::parse(format!("missing column {name}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let id_col = position(ID_COLUMN);

    let mut table = PqvTable::new();
    for (idx, line) in lines {
        let line_no = idx + 1;
        let cells: Vec<&str> = line.split(',').collect();
        if cells.len() != header.len() {
            return Err(ScanmarkError::parse(format!(
                "line {line_no}: expected {} cells, found {}",
                header.len(),
                cells.len()
            )));
        }
        let paper = parse_cell(cells[paper_col], line_no, PAPER_COLUMN)?;
        if table.contains(paper) {
            return Err(ScanmarkError::parse(format!(
                "line {line_no}: paper {paper} appears twice"
            )));
        }
        let versions = question_cols
            .iter()
            .map(|&c| parse_cell(cells[c], line_no, header[c]))
            .collect::<Result<Vec<_>>>()?;
        let id_version = match id_col.map(|c| cells[c].trim()) {
            Some(v) if !v.is_empty() => Some(parse_cell(v, line_no, ID_COLUMN)?),
            _ => None,
        };
        table.insert(
            paper,
            PqvRow {
                id_version,
                versions,
            },
        );
    }
    validate(layout, &table)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};

    const LAYOUT: &str = r#"
name = "final"
public_code = "93849"
num_pages = 6
num_versions = 3
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
pages = [4]
mark = 6

[[questions]]
label = "Q4"
pages = [5]
mark = 8
select = "fixed"

[[questions]]
label = "Q5"
pages = [6]
mark = 4
versions = [2, 3]
"#;

    fn layout() -> AssessmentLayout {
        AssessmentLayout::from_toml_str(LAYOUT).unwrap()
    }

    #[test]
    fn build_honours_constraints() {
        let layout = layout();
        let table = build(&layout, 40, Some(7)).unwrap();
        assert_eq!(table.len(), 40);
        validate(&layout, &table).unwrap();
        for (_, row) in table.iter() {
            assert_eq!(row.version_of(2), row.version_of(3));
            assert_eq!(row.version_of(4), Some(1));
            assert!(matches!(row.version_of(5), Some(2 | 3)));
        }
        assert_eq!(build(&layout, 40, Some(7)).unwrap(), table);
    }

    #[test]
    fn leftover_draws_vary_by_seed() {
        let heavy: BTreeSet<u32> = (0..32u64)
            .map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                let draws = balanced_draws(&[1, 2, 3], 4, &mut rng);
                (1..=3)
                    .find(|v| draws.iter().filter(|d| *d == v).count() == 2)
                    .unwrap()
            })
            .collect();
        assert!(heavy.len() > 1, "extra draw always went to {heavy:?}");
    }

    #[test]
    fn append_copies_template() {
        let layout = layout();
        let table = build(&layout, 10, Some(1)).unwrap();
        let extended = append(&table, &[61, 62], 4).unwrap();
        assert_eq!(extended.len(), 12);
        assert_eq!(extended.get(61), table.get(4));
        assert_eq!(extended.get(62), table.get(4));

        assert!(append(&table, &[3], 4).is_err());
        assert!(matches!(
            append(&table, &[70], 99),
            Err(ScanmarkError::NotFound { .. })
        ));
    }

    #[test]
    fn validate_rejects_split_component() {
        let layout = layout();
        let mut table = PqvTable::new();
        table.insert(1, PqvRow::new(vec![1, 2, 3, 1, 2]));
        let err = validate(&layout, &table).unwrap_err();
        assert!(err.to_string().contains("share a page"));

        let mut table = PqvTable::new();
        table.insert(1, PqvRow::new(vec![1, 2, 2, 1, 1]));
        assert!(validate(&layout, &table).is_err());
    }

    #[test]
    fn csv_roundtrip_keeps_id_version() {
        let layout = layout();
        let mut table = build(&layout, 3, Some(3)).unwrap();
        let mut row = table.get(2).cloned().unwrap();
        row.id_version = Some(2);
        table.insert(2, row);

        let text = to_csv(&layout, &table);
        assert!(text.starts_with(
            "paper_number,q1.version,q2.version,q3.version,q4.version,q5.version,id.version\n"
        ));
        assert_eq!(from_csv(&layout, &text).unwrap(), table);
    }

    #[test]
    fn csv_import_reports_lines() {
        let layout = layout();
        let text = "paper_number,q1.version,q2.version,q3.version,q4.version,q5.version\n\
                    1,1,2,2,1,3\n\
                    2,x,2,2,1,3\n";
        let err = from_csv(&layout, text).unwrap_err();
        assert!(err.to_string().contains("line 3"));

        let missing = "paper_number,q1.version\n1,1\n";
        assert!(from_csv(&layout, missing).is_err());
    }

    proptest! {
        #[test]
        fn random_questions_are_balanced(papers in 1u32..200, seed in any::<u64>()) {
            let layout = layout();
            let table = build(&layout, papers, Some(seed)).unwrap();
            for (question, allowed) in [(1u32, vec![1u32, 2, 3]), (5, vec![2, 3])] {
                let mut counts: BTreeMap<u32, u32> = allowed.iter().map(|v| (*v, 0)).collect();
                for (_, row) in table.iter() {
                    *counts.get_mut(&row.version_of(question).unwrap()).unwrap() += 1;
                }
                let max = counts.values().max().copied().unwrap();
                let min = counts.values().min().copied().unwrap();
                prop_assert!(max - min <= 1, "question {} counts {:?}", question, counts);
            }
        }
    }
}
