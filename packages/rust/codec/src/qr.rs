//! QR payloads printed in the corners of every page.
//!
//! A paper-page payload is 14 ASCII digits:
//!
//! ```text
//! PPPP pp v c CCCCC k
//! │    │  │ │ │     └ Luhn check digit over the first 13 digits
//! │    │  │ │ └────── public code of the assessment
//! │    │  │ └──────── corner (1 NE, 2 NW, 3 SW, 4 SE)
//! │    │  └────────── version
//! │    └───────────── page
//! └────────────────── paper
//! ```
//!
//! Supplementary and scrap sheets carry `EXTRA<c>` / `SCRAP<c>`.

use scanmark_shared::{Result, ScanmarkError};

use crate::code::{PageCode, Tpv};

/// Length of a paper-page payload.
pub const PAYLOAD_LEN: usize = 14;

const EXTRA_PREFIX: &str = "EXTRA";
const SCRAP_PREFIX: &str = "SCRAP";

/// Corner of the page a payload was printed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Corner {
    NorthEast,
    NorthWest,
    SouthWest,
    SouthEast,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::NorthEast,
        Corner::NorthWest,
        Corner::SouthWest,
        Corner::SouthEast,
    ];

    fn digit(self) -> u32 {
        match self {
            Self::NorthEast => 1,
            Self::NorthWest => 2,
            Self::SouthWest => 3,
            Self::SouthEast => 4,
        }
    }

    fn from_digit(d: u32) -> Option<Self> {
        match d {
            1 => Some(Self::NorthEast),
            2 => Some(Self::NorthWest),
            3 => Some(Self::SouthWest),
            4 => Some(Self::SouthEast),
            _ => None,
        }
    }
}

/// A successfully decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPayload {
    pub code: PageCode,
    pub corner: Corner,
}

/// Luhn check digit for a string of ASCII digits.
fn luhn_check_digit(digits: &str) -> u32 {
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    (10 - sum % 10) % 10
}

fn check_public_code(public_code: &str) -> Result<()> {
    if public_code.len() != 5 || !public_code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScanmarkError::validation(format!(
            "public code must be 5 digits, got {public_code:?}"
        )));
    }
    Ok(())
}

/// Encode the payload printed at `corner` for `code`.
pub fn encode(code: PageCode, corner: Corner, public_code: &str) -> Result<String> {
    match code {
        PageCode::Extra => Ok(format!("{EXTRA_PREFIX}{}", corner.digit())),
        PageCode::Scrap => Ok(format!("{SCRAP_PREFIX}{}", corner.digit())),
        PageCode::Paper(tpv) => {
            check_public_code(public_code)?;
            let tpv = Tpv::new(tpv.paper, tpv.page, tpv.version)?;
            let body = format!(
                "{:04}{:02}{}{}{}",
                tpv.paper,
                tpv.page,
                tpv.version,
                corner.digit(),
                public_code
            );
            let check = luhn_check_digit(&body);
            Ok(format!("{body}{check}"))
        }
    }
}

/// Decode one payload, checking format, check digit and public code.
pub fn decode(payload: &str, public_code: &str) -> Result<DecodedPayload> {
    let payload = payload.trim();

    for (prefix, code) in [(EXTRA_PREFIX, PageCode::Extra), (SCRAP_PREFIX, PageCode::Scrap)] {
        if let Some(rest) = payload.strip_prefix(prefix) {
            let corner = rest
                .parse::<u32>()
                .ok()
                .filter(|_| rest.len() == 1)
                .and_then(Corner::from_digit)
                .ok_or_else(|| ScanmarkError::invalid_code(payload, "bad corner digit"))?;
            return Ok(DecodedPayload { code, corner });
        }
    }

    if payload.len() != PAYLOAD_LEN {
        return Err(ScanmarkError::invalid_code(
            payload,
            format!("expected {PAYLOAD_LEN} digits, got {}", payload.len()),
        ));
    }
    if !payload.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScanmarkError::invalid_code(payload, "non-digit characters"));
    }

    let (body, check) = payload.split_at(PAYLOAD_LEN - 1);
    let expected = luhn_check_digit(body);
    if check.parse::<u32>().ok() != Some(expected) {
        return Err(ScanmarkError::invalid_code(payload, "check digit mismatch"));
    }

    // All digits from here on.
    let num = |range: std::ops::Range<usize>| body[range].parse::<u32>().unwrap_or(0);
    let corner = Corner::from_digit(num(7..8))
        .ok_or_else(|| ScanmarkError::invalid_code(payload, "bad corner digit"))?;
    if &body[8..13] != public_code {
        return Err(ScanmarkError::invalid_code(
            payload,
            format!("public code {} does not match this assessment", &body[8..13]),
        ));
    }
    let tpv = Tpv::new(num(0..4), num(4..6), num(6..7))
        .map_err(|e| ScanmarkError::invalid_code(payload, e.to_string()))?;

    Ok(DecodedPayload {
        code: PageCode::Paper(tpv),
        corner,
    })
}

/// Decode all payloads read from one image.
///
/// Unreadable corners are ignored; the readable ones must agree.
pub fn decode_page<S: AsRef<str>>(payloads: &[S], public_code: &str) -> Result<PageCode> {
    let mut found: Option<PageCode> = None;
    let mut last_error: Option<ScanmarkError> = None;

    for raw in payloads {
        match decode(raw.as_ref(), public_code) {
            Ok(decoded) => match found {
                None => found = Some(decoded.code),
                Some(code) if code == decoded.code => {}
                Some(code) => {
                    return Err(ScanmarkError::invalid_code(
                        raw.as_ref(),
                        format!("inconsistent corner codes: {code} vs {}", decoded.code),
                    ));
                }
            },
            Err(e) => {
                tracing::debug!(payload = raw.as_ref(), error = %e, "unreadable corner");
                last_error = Some(e);
            }
        }
    }

    match (found, last_error) {
        (Some(code), _) => Ok(code),
        (None, Some(e)) => Err(e),
        (None, None) => Err(ScanmarkError::invalid_code("", "no QR codes found")),
    }
}
