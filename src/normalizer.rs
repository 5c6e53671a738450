//! Single-row normalization of raw trade CSV records.
//!
//! A raw row becomes a [`NormalizedRecord`] with a stable `trade_id`, a
//! canonical UTC timestamp and provenance columns, or it is rejected with a
//! [`RejectReason`]. Normalization is a pure function of the row and the
//! batch metadata.

use crate::error::{EtlError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Raw column carrying the trade key
pub const ID_COLUMN: &str = "id";
/// Raw column carrying the epoch time (seconds or milliseconds)
pub const TIME_COLUMN: &str = "time";

pub const TRADE_ID_COLUMN: &str = "trade_id";
pub const SOURCE_FILE_COLUMN: &str = "source_file";
pub const PROCESSED_DATE_COLUMN: &str = "processed_date";
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Numeric times above this are milliseconds since the epoch, otherwise
/// seconds. Fixed heuristic, not configurable.
pub const MILLIS_THRESHOLD: f64 = 1e12;

/// Columns appended by normalization; raw columns with these names are replaced
const DERIVED_COLUMNS: [&str; 3] = [SOURCE_FILE_COLUMN, PROCESSED_DATE_COLUMN, TIMESTAMP_COLUMN];

/// Constants attached to every record of one invocation
#[derive(Debug, Clone)]
pub struct BatchMetadata {
    pub source_file: Arc<str>,
    pub processed_date: NaiveDate,
}

impl BatchMetadata {
    pub fn new(source_file: &str, processed_date: NaiveDate) -> Self {
        Self {
            source_file: Arc::from(source_file),
            processed_date,
        }
    }

    /// Metadata stamped with today's UTC date
    pub fn today(source_file: &str) -> Self {
        Self::new(source_file, Utc::now().date_naive())
    }

    pub fn processed_date_str(&self) -> String {
        self.processed_date.format("%Y-%m-%d").to_string()
    }
}

/// Header layout of one input table
#[derive(Debug, Clone)]
pub struct InputSchema {
    raw_columns: Vec<String>,
    id_index: usize,
    time_index: usize,
    /// (raw index, output name) for every column carried into the output
    passthrough: Vec<(usize, String)>,
}

impl InputSchema {
    /// Validate a header row. `id` and `time` are required; a raw `trade_id`
    /// column would collide with the renamed key and is refused.
    pub fn from_headers<I, S>(headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw_columns: Vec<String> =
            headers.into_iter().map(|h| h.as_ref().to_string()).collect();

        let position = |name: &str| raw_columns.iter().position(|c| c == name);
        let id_index = position(ID_COLUMN)
            .ok_or_else(|| EtlError::Schema(format!("missing required column '{}'", ID_COLUMN)))?;
        let time_index = position(TIME_COLUMN)
            .ok_or_else(|| EtlError::Schema(format!("missing required column '{}'", TIME_COLUMN)))?;
        if position(TRADE_ID_COLUMN).is_some() {
            return Err(EtlError::Schema(format!(
                "input already has a '{}' column; it would collide with the renamed '{}'",
                TRADE_ID_COLUMN, ID_COLUMN
            )));
        }

        let mut passthrough = Vec::with_capacity(raw_columns.len());
        for (idx, name) in raw_columns.iter().enumerate() {
            if idx == id_index {
                passthrough.push((idx, TRADE_ID_COLUMN.to_string()));
            } else if DERIVED_COLUMNS.contains(&name.as_str()) {
                warn!("Raw column '{}' is replaced by the derived column of the same name", name);
            } else if name == ID_COLUMN {
                warn!("Dropping duplicate '{}' column at position {}", ID_COLUMN, idx);
            } else {
                passthrough.push((idx, name.clone()));
            }
        }

        Ok(Self {
            raw_columns,
            id_index,
            time_index,
            passthrough,
        })
    }

    pub fn raw_columns(&self) -> &[String] {
        &self.raw_columns
    }

    /// Output names of the carried columns, `trade_id` in place of `id`
    pub fn passthrough_columns(&self) -> impl Iterator<Item = &str> {
        self.passthrough.iter().map(|(_, name)| name.as_str())
    }

    pub fn passthrough_len(&self) -> usize {
        self.passthrough.len()
    }

    /// Position of `trade_id` among the passthrough columns
    pub fn trade_id_position(&self) -> usize {
        self.passthrough
            .iter()
            .position(|(idx, _)| *idx == self.id_index)
            .unwrap_or(0)
    }
}

/// One CSV line. Empty fields are null; missing trailing fields are null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based data row number (header excluded)
    pub row_number: usize,
    pub values: Vec<Option<String>>,
}

impl RawRow {
    pub fn from_fields<I, S>(row_number: usize, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = fields
            .into_iter()
            .map(|f| {
                let f = f.as_ref();
                if f.is_empty() {
                    None
                } else {
                    Some(f.to_string())
                }
            })
            .collect();
        Self { row_number, values }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }
}

/// Why a row was routed to the rejected output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    MissingTradeId,
    UnparseableTime,
    TimestampOutOfRange,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingTradeId => "missing_trade_id",
            RejectReason::UnparseableTime => "unparseable_time",
            RejectReason::TimestampOutOfRange => "timestamp_out_of_range",
        }
    }

    pub fn into_error(self, row: usize) -> EtlError {
        EtlError::Parse {
            row,
            reason: self.code().to_string(),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub row: RawRow,
    pub reason: RejectReason,
}

/// A raw row after normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub trade_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_file: Arc<str>,
    pub processed_date: NaiveDate,
    /// Carried columns in [`InputSchema::passthrough_columns`] order
    pub columns: Vec<Option<String>>,
    /// Input position, used as the dedup tie-break
    pub row_number: usize,
}

/// Parse the raw `time` field as a float; surrounding whitespace is ignored
/// and non-finite values are treated as unparseable.
pub fn parse_time(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Apply the unit heuristic and convert to a UTC instant with microsecond
/// precision (fractions truncated toward zero).
pub fn derive_timestamp(numeric_time: f64) -> Option<DateTime<Utc>> {
    let seconds = if numeric_time > MILLIS_THRESHOLD {
        numeric_time / 1000.0
    } else {
        numeric_time
    };

    let micros = (seconds * 1_000_000.0).trunc();
    // i64::MAX is not exactly representable; stay strictly below it
    if !micros.is_finite() || micros < i64::MIN as f64 || micros >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Normalize one row against the batch's schema and metadata
pub fn normalize_row(
    schema: &InputSchema,
    row: &RawRow,
    meta: &BatchMetadata,
) -> std::result::Result<NormalizedRecord, RejectReason> {
    // the key is carried verbatim; only a blank field counts as missing
    let trade_id = row
        .get(schema.id_index)
        .filter(|id| !id.trim().is_empty())
        .ok_or(RejectReason::MissingTradeId)?;

    let numeric_time = row
        .get(schema.time_index)
        .and_then(parse_time)
        .ok_or(RejectReason::UnparseableTime)?;

    let timestamp = derive_timestamp(numeric_time).ok_or(RejectReason::TimestampOutOfRange)?;

    let columns = schema
        .passthrough
        .iter()
        .map(|(idx, _)| {
            if *idx == schema.id_index {
                Some(trade_id.to_string())
            } else {
                row.values.get(*idx).cloned().flatten()
            }
        })
        .collect();

    Ok(NormalizedRecord {
        trade_id: trade_id.to_string(),
        timestamp,
        source_file: Arc::clone(&meta.source_file),
        processed_date: meta.processed_date,
        columns,
        row_number: row.row_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> InputSchema {
        InputSchema::from_headers(["id", "price", "qty", "time", "isBuyerMaker"]).unwrap()
    }

    fn meta() -> BatchMetadata {
        BatchMetadata::new(
            "uploads/trades.csv",
            NaiveDate::from_ymd_opt(2024, 11, 20).unwrap(),
        )
    }

    #[test]
    fn test_seconds_are_taken_directly() {
        for value in [0.0, 1.0, 1_700_000_000.0, 999_999_999_999.0, 1e12] {
            let ts = derive_timestamp(value).unwrap();
            assert_eq!(ts.timestamp_micros(), (value * 1_000_000.0) as i64, "value {}", value);
        }
    }

    #[test]
    fn test_milliseconds_above_threshold() {
        let ts = derive_timestamp(1_700_000_002_000.0).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_002);
        assert_eq!(ts.timestamp_subsec_micros(), 0);

        let ts = derive_timestamp(1_700_000_002_500.0).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_002_500);

        // just above the threshold is already milliseconds
        let ts = derive_timestamp(1e12 + 1000.0).unwrap();
        assert_eq!(ts.timestamp(), 1_000_000_001);
    }

    #[test]
    fn test_negative_and_fractional_seconds() {
        let ts = derive_timestamp(-1.5).unwrap();
        assert_eq!(ts.timestamp_micros(), -1_500_000);

        let ts = derive_timestamp(10.25).unwrap();
        assert_eq!(ts.timestamp_micros(), 10_250_000);
    }

    #[test]
    fn test_out_of_range_instant() {
        assert!(derive_timestamp(-1e300).is_none());
        assert!(derive_timestamp(1e30).is_none());
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time(" 1700000000 "), Some(1_700_000_000.0));
        assert_eq!(parse_time("1.7e9"), Some(1.7e9));
        assert_eq!(parse_time("abc"), None);
        assert_eq!(parse_time("NaN"), None);
        assert_eq!(parse_time("inf"), None);
        assert_eq!(parse_time(""), None);
    }

    #[test]
    fn test_normalize_renames_and_attaches_metadata() {
        let row = RawRow::from_fields(1, ["42", "101.5", "0.3", "1700000000", "true"]);
        let record = normalize_row(&schema(), &row, &meta()).unwrap();

        assert_eq!(record.trade_id, "42");
        assert_eq!(record.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(&*record.source_file, "uploads/trades.csv");
        assert_eq!(record.processed_date.to_string(), "2024-11-20");
        assert_eq!(record.row_number, 1);
        assert_eq!(
            record.columns,
            vec![
                Some("42".to_string()),
                Some("101.5".to_string()),
                Some("0.3".to_string()),
                Some("1700000000".to_string()),
                Some("true".to_string()),
            ]
        );
    }

    #[test]
    fn test_normalize_rejections() {
        let schema = schema();
        let meta = meta();

        let missing_id = RawRow::from_fields(1, ["", "1", "1", "1700000000", "false"]);
        assert_eq!(
            normalize_row(&schema, &missing_id, &meta),
            Err(RejectReason::MissingTradeId)
        );

        let bad_time = RawRow::from_fields(2, ["7", "1", "1", "yesterday", "false"]);
        assert_eq!(
            normalize_row(&schema, &bad_time, &meta),
            Err(RejectReason::UnparseableTime)
        );

        let ragged = RawRow::from_fields(3, ["8", "1"]);
        assert_eq!(
            normalize_row(&schema, &ragged, &meta),
            Err(RejectReason::UnparseableTime)
        );

        let far_future = RawRow::from_fields(4, ["9", "1", "1", "1e30", "false"]);
        assert_eq!(
            normalize_row(&schema, &far_future, &meta),
            Err(RejectReason::TimestampOutOfRange)
        );
    }

    #[test]
    fn test_ragged_passthrough_is_null() {
        let row = RawRow::from_fields(5, ["11", "", "0.1", "1700000000"]);
        let record = normalize_row(&schema(), &row, &meta()).unwrap();
        assert_eq!(record.columns[1], None);
        assert_eq!(record.columns[4], None);
    }

    #[test]
    fn test_schema_requires_id_and_time() {
        assert!(matches!(
            InputSchema::from_headers(["price", "time"]),
            Err(EtlError::Schema(_))
        ));
        assert!(matches!(
            InputSchema::from_headers(["id", "price"]),
            Err(EtlError::Schema(_))
        ));
        assert!(matches!(
            InputSchema::from_headers(["id", "time", "trade_id"]),
            Err(EtlError::Schema(_))
        ));
    }

    #[test]
    fn test_schema_replaces_derived_columns() {
        let schema = InputSchema::from_headers(["timestamp", "id", "time", "source_file"]).unwrap();
        let names: Vec<&str> = schema.passthrough_columns().collect();
        assert_eq!(names, vec!["trade_id", "time"]);
        assert_eq!(schema.trade_id_position(), 0);
    }

    #[test]
    fn test_trade_id_is_not_trimmed() {
        let row = RawRow::from_fields(1, [" 42 ", "1", "1", "1700000000", "true"]);
        let record = normalize_row(&schema(), &row, &meta()).unwrap();
        assert_eq!(record.trade_id, " 42 ");
        assert_eq!(record.columns[0].as_deref(), Some(" 42 "));

        let blank = RawRow::from_fields(2, ["   ", "1", "1", "1700000000", "true"]);
        assert_eq!(
            normalize_row(&schema(), &blank, &meta()),
            Err(RejectReason::MissingTradeId)
        );
    }

    #[test]
    fn test_header_names_match_exactly() {
        assert!(matches!(
            InputSchema::from_headers(["id", " time"]),
            Err(EtlError::Schema(_))
        ));
        assert!(matches!(
            InputSchema::from_headers(["ID", "time"]),
            Err(EtlError::Schema(_))
        ));
    }

    #[test]
    fn test_reject_reason_error() {
        let err = RejectReason::UnparseableTime.into_error(12);
        assert!(matches!(err, EtlError::Parse { row: 12, .. }));
        assert_eq!(RejectReason::MissingTradeId.to_string(), "missing_trade_id");
    }
}
