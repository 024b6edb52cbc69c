//! Checkpoint model types.
//!
//! A [`CheckpointRecord`] is one durable row of the
//! `commcare_export_runs` table. After a successful dataset pull,
//! exactly one row per (query_md5, key, table, project, host) carries
//! `final = true`; finalization deletes the non-final rows for the
//! same scope.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `since_param` storage format: ISO-8601 UTC, no timezone suffix,
/// microseconds stripped.
pub const SINCE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Pagination strategy persisted with each checkpoint.
///
/// Preserved across runs so a pull started under a legacy mode keeps
/// using it until the operator starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    /// Date-windowed on `indexed_on` (current default for forms/cases).
    DateIndexed,
    /// Date-windowed on the legacy server-modified timestamp.
    DateModified,
    /// Opaque server-issued cursor token.
    Cursor,
    /// Plain offset/limit paging.
    Offset,
}

impl PaginationMode {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DateIndexed => "date_indexed",
            Self::DateModified => "date_modified",
            Self::Cursor => "cursor",
            Self::Offset => "offset",
        }
    }

    /// Parse a stored pagination mode.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "date_indexed" => Some(Self::DateIndexed),
            "date_modified" => Some(Self::DateModified),
            "cursor" => Some(Self::Cursor),
            "offset" => Some(Self::Offset),
            _ => None,
        }
    }

    /// `true` for the date-windowed modes.
    #[must_use]
    pub fn is_date(self) -> bool {
        matches!(self, Self::DateIndexed | Self::DateModified)
    }
}

impl fmt::Display for PaginationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Row id (UUID string).
    pub id: String,
    /// Name of the query file, when the query came from a file.
    pub query_file_name: Option<String>,
    /// MD5 hex digest of the query source.
    pub query_file_md5: String,
    /// Remote collection the dataset pulled from (form, case, ...).
    pub data_source: Option<String>,
    /// Destination table this row tracks.
    pub table_name: Option<String>,
    /// CommCare project space.
    pub project: String,
    /// CommCare HQ base URL.
    pub commcare_host: String,
    /// Optional operator-supplied dedupe key.
    pub key: Option<String>,
    /// Pagination strategy in effect when the row was written.
    pub pagination_mode: PaginationMode,
    /// ISO-8601 UTC timestamp (no suffix) or opaque cursor, per
    /// `pagination_mode`.
    pub since_param: Option<String>,
    /// Remote id of the last successfully processed record.
    pub last_doc_id: Option<String>,
    /// Opaque cursor token for cursor-mode pulls.
    pub cursor: Option<String>,
    /// When this checkpoint was written (ISO-8601 UTC).
    pub time_of_run: String,
    /// `true` once the dataset completed.
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Progress snapshot handed from the paginator to the checkpoint
/// manager between pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationState {
    /// Maximum timestamp seen so far, formatted with [`SINCE_FORMAT`].
    pub since: Option<String>,
    /// Opaque cursor token, for cursor-mode pulls.
    pub cursor: Option<String>,
    /// Remote id of the last record in the batch.
    pub last_doc_id: Option<String>,
}

/// Format a timestamp for `since_param` storage (microseconds
/// stripped, no timezone suffix).
#[must_use]
pub fn format_since(ts: NaiveDateTime) -> String {
    ts.format(SINCE_FORMAT).to_string()
}

/// Parse a timestamp in any of the shapes the remote API or an
/// operator is likely to hand us.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
        if fmt == "%Y-%m-%d" {
            if let Ok(d) = chrono::NaiveDate::parse_from_str(s, fmt) {
                return Some(d.and_hms_opt(0, 0, 0).expect("midnight is valid"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_mode_roundtrip() {
        for mode in [
            PaginationMode::DateIndexed,
            PaginationMode::DateModified,
            PaginationMode::Cursor,
            PaginationMode::Offset,
        ] {
            assert_eq!(PaginationMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(PaginationMode::parse("bogus"), None);
    }

    #[test]
    fn since_format_strips_micros_and_zone() {
        let ts = parse_timestamp("2017-01-01T15:36:22.123456Z").unwrap();
        assert_eq!(format_since(ts), "2017-01-01T15:36:22");
    }

    #[test]
    fn parse_timestamp_shapes() {
        assert!(parse_timestamp("2017-01-01T15:36:22Z").is_some());
        assert!(parse_timestamp("2017-01-01T15:36:22").is_some());
        assert!(parse_timestamp("2017-01-01 15:36:22").is_some());
        assert!(parse_timestamp("2017-01-01").is_some());
        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn checkpoint_record_serde_final_key() {
        let rec = CheckpointRecord {
            id: "abc".into(),
            query_file_name: None,
            query_file_md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
            data_source: Some("form".into()),
            table_name: Some("forms".into()),
            project: "demo".into(),
            commcare_host: "https://www.commcarehq.org".into(),
            key: None,
            pagination_mode: PaginationMode::DateIndexed,
            since_param: Some("2017-01-01T15:36:22".into()),
            last_doc_id: Some("doc 2".into()),
            cursor: None,
            time_of_run: "2017-01-02T00:00:00".into(),
            is_final: true,
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json.get("final"), Some(&serde_json::json!(true)));
        let back: CheckpointRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}
