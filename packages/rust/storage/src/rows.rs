//! Row decoding and value encoding helpers.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, Rows};
use scanmark_shared::{Result, ScanmarkError};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn db_err(e: libsql::Error) -> ScanmarkError {
    ScanmarkError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so stored timestamps compare as text.
pub(crate) fn ts_text(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_text() -> String {
    ts_text(&Utc::now())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ScanmarkError::Storage(format!("invalid date {s:?}: {e}")))
}

pub(crate) fn text(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

/// NULL (or a type mismatch) reads as `None`.
pub(crate) fn opt_text(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn int(row: &Row, idx: i32) -> Result<u32> {
    row.get::<u32>(idx).map_err(db_err)
}

pub(crate) fn opt_int(row: &Row, idx: i32) -> Option<u32> {
    row.get::<u32>(idx).ok()
}

pub(crate) fn count(row: &Row, idx: i32) -> Result<u64> {
    row.get::<i64>(idx)
        .map(|n| n.max(0) as u64)
        .map_err(db_err)
}

pub(crate) fn real(row: &Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx).map_err(db_err)
}

pub(crate) fn flag(row: &Row, idx: i32) -> Result<bool> {
    row.get::<i64>(idx).map(|v| v != 0).map_err(db_err)
}

pub(crate) fn timestamp(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&text(row, idx)?)
}

pub(crate) fn opt_timestamp(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    opt_text(row, idx).map(|s| parse_ts(&s)).transpose()
}

/// Parse a text column with `FromStr` (ids, stored enums).
pub(crate) fn parsed<T>(row: &Row, idx: i32) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = text(row, idx)?;
    raw.parse::<T>()
        .map_err(|e| ScanmarkError::Storage(format!("bad stored value {raw:?}: {e}")))
}

pub(crate) fn opt_parsed<T>(row: &Row, idx: i32) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match opt_text(row, idx) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ScanmarkError::Storage(format!("bad stored value {raw:?}: {e}"))),
        None => Ok(None),
    }
}

pub(crate) fn json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<T> {
    let raw = text(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| ScanmarkError::Storage(format!("bad stored json {raw:?}: {e}")))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ScanmarkError::Storage(e.to_string()))
}

/// Next row, with errors propagated.
pub(crate) async fn next(rows: &mut Rows) -> Result<Option<Row>> {
    rows.next().await.map_err(db_err)
}
