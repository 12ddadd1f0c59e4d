use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Row identifier, assigned sequentially during ingestion starting at 0.
pub type RowId = u32;

/// Identity of a source file, used to key cached index and tag snapshots.
/// Re-opening a file with the same fingerprint reattaches prior state;
/// any component change invalidates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub file_name: String,
    pub file_size: u64,
    pub last_modified: i64,
}

impl Fingerprint {
    pub fn new(file_name: impl Into<String>, file_size: u64, last_modified: i64) -> Self {
        Fingerprint {
            file_name: file_name.into(),
            file_size,
            last_modified,
        }
    }

    /// Stable key usable inside a store file name.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.file_size, self.last_modified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Boolean,
    Date,
}

/// One materialized cell. Text cells hold a refcounted view into the
/// batch payload, so cloning is cheap.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(Bytes),
    Number(f64),
    Boolean(bool),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_str(&self) -> Option<Cow<'_, str>> {
        match self {
            CellValue::Text(b) => Some(String::from_utf8_lossy(b)),
            _ => None,
        }
    }

    /// Display form used by row materialization and group keys.
    pub fn display(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Text(b) => Some(String::from_utf8_lossy(b).into_owned()),
            CellValue::Number(n) => Some(format_number(*n)),
            CellValue::Boolean(b) => Some(b.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            CellValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            CellValue::Null => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Per-column result of incremental type inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInference {
    pub column: String,
    pub detected: ColumnType,
    /// Share of non-null values consistent with `detected`, 0..=1.
    pub confidence: f64,
    pub null_count: u64,
    pub min_number: Option<f64>,
    pub max_number: Option<f64>,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub examples: Vec<String>,
    /// More distinct values were seen than `examples` retains.
    pub truncated: bool,
}

/// Parse a cell as a datetime, trying the formats the ingested files
/// actually carry. Returns UTC.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

pub fn parse_boolean(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_cache_key_is_stable() {
        let fp = Fingerprint::new("data.csv", 1024, 1700000000);
        assert_eq!(fp.cache_key(), "1024-1700000000");
    }

    #[test]
    fn datetime_parsing_accepts_common_formats() {
        assert!(parse_datetime("2024-03-01").is_some());
        assert!(parse_datetime("2024-03-01 10:30:00").is_some());
        assert!(parse_datetime("2024-03-01T10:30:00+00:00").is_some());
        assert!(parse_datetime("not a date").is_none());
    }

    #[test]
    fn number_display_drops_trailing_fraction() {
        assert_eq!(CellValue::Number(30.0).display().unwrap(), "30");
        assert_eq!(CellValue::Number(2.5).display().unwrap(), "2.5");
    }
}
