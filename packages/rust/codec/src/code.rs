//! Text form of page codes.
//!
//! - Paper pages: `t<paper:4>p<page:2>v<version:1>`, e.g. `t0020p03v1`
//! - Supplementary pages: `extra`
//! - Scrap pages: `scrap`

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use scanmark_shared::{MAX_PAGES, MAX_PAPER, MAX_VERSIONS, Result, ScanmarkError};

/// Text of the extra-page sentinel.
pub const EXTRA_TEXT: &str = "extra";

/// Text of the scrap-page sentinel.
pub const SCRAP_TEXT: &str = "scrap";

/// Matches `t0020p03v1`.
static TPV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^t(\d{4})p(\d{2})v(\d)$").expect("tpv regex"));

/// A (paper, page, version) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tpv {
    pub paper: u32,
    pub page: u32,
    pub version: u32,
}

impl Tpv {
    /// Build a triple, checking every field fits the fixed-width code.
    pub fn new(paper: u32, page: u32, version: u32) -> Result<Self> {
        let tpv = Self {
            paper,
            page,
            version,
        };
        tpv.check()?;
        Ok(tpv)
    }

    fn check(&self) -> Result<()> {
        if self.paper == 0 || self.paper > MAX_PAPER {
            return Err(ScanmarkError::invalid_code(
                self.to_string(),
                format!("paper must be in 1..={MAX_PAPER}"),
            ));
        }
        if self.page == 0 || self.page > MAX_PAGES {
            return Err(ScanmarkError::invalid_code(
                self.to_string(),
                format!("page must be in 1..={MAX_PAGES}"),
            ));
        }
        if self.version == 0 || self.version > MAX_VERSIONS {
            return Err(ScanmarkError::invalid_code(
                self.to_string(),
                format!("version must be in 1..={MAX_VERSIONS}"),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Tpv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{:04}p{:02}v{}", self.paper, self.page, self.version)
    }
}

impl FromStr for Tpv {
    type Err = ScanmarkError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = TPV_RE
            .captures(s)
            .ok_or_else(|| ScanmarkError::invalid_code(s, "expected t<4 digits>p<2 digits>v<digit>"))?;
        // The regex guarantees ASCII digits of bounded width.
        let field = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
        Self::new(field(1), field(2), field(3))
    }
}

/// What a page's code says it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageCode {
    Paper(Tpv),
    Extra,
    Scrap,
}

impl fmt::Display for PageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paper(tpv) => tpv.fmt(f),
            Self::Extra => f.write_str(EXTRA_TEXT),
            Self::Scrap => f.write_str(SCRAP_TEXT),
        }
    }
}

impl FromStr for PageCode {
    type Err = ScanmarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            EXTRA_TEXT => Ok(Self::Extra),
            SCRAP_TEXT => Ok(Self::Scrap),
            other => other.parse().map(Self::Paper),
        }
    }
}
