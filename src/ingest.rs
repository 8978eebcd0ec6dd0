//! CSV log ingestion
//!
//! Loads a tabular event log, parses the list-valued cells (roles, messages,
//! resources) from their serialized form, and normalizes the rows into an
//! [`EventLog`]. Missing required columns and unparseable timestamps are
//! fatal; ill-formed list cells degrade silently to the empty list.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::path::Path;
use tracing::{debug, info};

use crate::event_log::{CollaborationMetadata, EventLog, EventRecord};
use crate::{CmipError, Result};

const REQUIRED_COLUMNS: [&str; 4] = ["case_id", "tran", "timestamp", "roles"];

/// Loads a CSV event log from disk.
pub fn load_csv_log(path: &Path) -> Result<EventLog> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| CmipError::Ingestion(format!("cannot open {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| CmipError::Ingestion(format!("cannot read header row: {}", e)))?
        .clone();

    let column = |name: &str| headers.iter().position(|h| h == name);
    for required in REQUIRED_COLUMNS {
        if column(required).is_none() {
            return Err(CmipError::Ingestion(format!(
                "missing required column `{}`",
                required
            )));
        }
    }

    let case_col = column("case_id").unwrap_or_default();
    let tran_col = column("tran").unwrap_or_default();
    let ts_col = column("timestamp").unwrap_or_default();
    let roles_col = column("roles").unwrap_or_default();
    let send_col = column("send_msg");
    let recv_col = column("rec_msg");
    let req_col = column("req_res");
    let rel_col = column("rel_res");

    let mut events = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| CmipError::Ingestion(format!("row {}: {}", row + 2, e)))?;
        let cell = |col: usize| record.get(col).unwrap_or("");
        let list_cell = |col: Option<usize>| col.map(|c| parse_list_field(cell(c))).unwrap_or_default();

        let raw_ts = cell(ts_col);
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            CmipError::Ingestion(format!("row {}: unparseable timestamp `{}`", row + 2, raw_ts))
        })?;

        // roles is a set: drop repeated department names, keeping order
        let mut roles: Vec<String> = Vec::new();
        for role in parse_list_field(cell(roles_col)) {
            if !roles.contains(&role) {
                roles.push(role);
            }
        }

        events.push(EventRecord {
            case_id: cell(case_col).to_string(),
            activity: cell(tran_col).to_string(),
            timestamp,
            roles,
            send_msg: list_cell(send_col),
            recv_msg: list_cell(recv_col),
            req_res: list_cell(req_col),
            rel_res: list_cell(rel_col),
        });
    }

    debug!(rows = events.len(), path = %path.display(), "parsed csv log");
    EventLog::from_events(events)
}

/// Loads the log and derives its collaboration metadata.
pub fn load_and_prepare(path: &Path) -> Result<(EventLog, CollaborationMetadata)> {
    let log = load_csv_log(path)?;
    let metadata = CollaborationMetadata::from_log(&log);
    info!(
        cases = metadata.total_cases,
        events = metadata.total_events,
        departments = metadata.departments.len(),
        sync_tasks = metadata.sync_tasks.len(),
        messages = metadata.messages.len(),
        resources = metadata.resources.len(),
        "log loaded"
    );
    Ok((log, metadata))
}

/// Parses a serialized list cell such as `['a', 'b']` or `["a"]`.
///
/// Empty cells and `[]` yield the empty list. Items must be quoted strings
/// or numeric literals; anything else makes the whole cell degrade to the
/// empty list rather than failing the row.
pub fn parse_list_field(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "[]" {
        return Vec::new();
    }

    if let Some(inner) = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        match split_items(inner) {
            Some(items) => {
                let mut values = Vec::new();
                for item in items {
                    let item = item.trim();
                    if item.is_empty() {
                        continue;
                    }
                    match parse_scalar(item) {
                        Some(value) => values.push(value),
                        None => return Vec::new(),
                    }
                }
                values
            }
            None => Vec::new(),
        }
    } else {
        parse_scalar(trimmed).map(|v| vec![v]).unwrap_or_default()
    }
}

/// Splits on top-level commas, honoring single and double quotes. Returns
/// `None` on unbalanced quotes.
fn split_items(inner: &str) -> Option<Vec<String>> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in inner.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => {
                    items.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    items.push(current);
    Some(items)
}

/// A quoted string or a numeric literal; bare words are ill-formed.
fn parse_scalar(item: &str) -> Option<String> {
    let bytes = item.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return Some(item[1..item.len() - 1].to_string());
        }
    }
    if item.parse::<f64>().is_ok() {
        return Some(item.to_string());
    }
    None
}

/// Accepts RFC 3339 as well as the common space/`T`-separated and date-only
/// forms. Naive timestamps are interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    #[test_case("", &[]; "empty cell")]
    #[test_case("[]", &[]; "empty list")]
    #[test_case("['a']", &["a"]; "single quoted")]
    #[test_case("[\"a\", \"b\"]", &["a", "b"]; "double quoted pair")]
    #[test_case("['m1', 'm2']", &["m1", "m2"]; "single quoted pair")]
    #[test_case("[1, 2]", &["1", "2"]; "numeric items")]
    #[test_case("'solo'", &["solo"]; "quoted scalar")]
    #[test_case("42", &["42"]; "numeric scalar")]
    #[test_case("bare", &[]; "bare word degrades")]
    #[test_case("[a, b]", &[]; "bare items degrade")]
    #[test_case("['open", &[]; "unbalanced quote degrades")]
    #[test_case("[ 'x' , ]", &["x"]; "trailing comma tolerated")]
    fn test_parse_list_field(raw: &str, expected: &[&str]) {
        assert_eq!(parse_list_field(raw), expected);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-02T03:04:05Z").is_some());
        assert!(parse_timestamp("2024-01-02 03:04:05").is_some());
        assert!(parse_timestamp("2024-01-02T03:04:05.123").is_some());
        assert!(parse_timestamp("2024-01-02").is_some());
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
    }

    fn write_log(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_csv_log() {
        let file = write_log(
            "case_id,tran,timestamp,roles,send_msg,rec_msg,req_res,rel_res\n\
             c1,A,2024-01-01 10:00:00,['X'],['m1'],[],['r1'],[]\n\
             c1,B,2024-01-01 10:01:00,['Y'],[],['m1'],[],['r1']\n",
        );

        let (log, meta) = load_and_prepare(file.path()).unwrap();
        assert_eq!(log.total_events(), 2);
        assert_eq!(meta.departments, vec!["X", "Y"]);
        assert_eq!(meta.messages["m1"].sender.as_deref(), Some("A"));
        assert_eq!(meta.messages["m1"].receiver.as_deref(), Some("B"));
        assert_eq!(meta.resources["r1"].requested_by, vec!["A"]);
        assert_eq!(meta.resources["r1"].released_by, vec!["B"]);
    }

    #[test]
    fn test_missing_required_column_fatal() {
        let file = write_log("case_id,timestamp,roles\nc1,2024-01-01,['X']\n");
        let err = load_csv_log(file.path()).unwrap_err();
        assert!(err.to_string().contains("tran"));
    }

    #[test]
    fn test_bad_timestamp_fatal() {
        let file = write_log(
            "case_id,tran,timestamp,roles\nc1,A,yesterday,['X']\n",
        );
        assert!(load_csv_log(file.path()).is_err());
    }

    #[test]
    fn test_optional_list_columns_missing() {
        let file = write_log(
            "case_id,tran,timestamp,roles\nc1,A,2024-01-01 09:00:00,['X']\n",
        );
        let log = load_csv_log(file.path()).unwrap();
        assert!(log.events[0].send_msg.is_empty());
        assert!(log.events[0].req_res.is_empty());
    }

    #[test]
    fn test_ill_formed_list_cell_degrades() {
        let file = write_log(
            "case_id,tran,timestamp,roles,send_msg,rec_msg,req_res,rel_res\n\
             c1,A,2024-01-01 09:00:00,['X'],not-a-list,[],[],[]\n",
        );
        let log = load_csv_log(file.path()).unwrap();
        assert!(log.events[0].send_msg.is_empty());
        assert_eq!(log.events[0].roles, vec!["X"]);
    }
}
