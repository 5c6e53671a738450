use super::{ObjectLocation, ObjectStore};
use crate::error::{EtlError, Result};
use crate::normalizer::RejectedRow;
use bytes::Bytes;
use csv::WriterBuilder;
use tracing::warn;

pub const REJECTED_FILE: &str = "rejected.csv";

/// Encode rejected rows as CSV: the raw columns, then `reject_reason` and `row_number`
pub fn encode_rejected(raw_columns: &[String], rejected: &[RejectedRow]) -> Result<Bytes> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header: Vec<&str> = raw_columns.iter().map(String::as_str).collect();
    header.push("reject_reason");
    header.push("row_number");
    writer.write_record(&header)?;

    for entry in rejected {
        let mut record: Vec<String> = (0..raw_columns.len())
            .map(|idx| entry.row.get(idx).unwrap_or_default().to_string())
            .collect();
        record.push(entry.reason.code().to_string());
        record.push(entry.row.row_number.to_string());
        writer.write_record(&record)?;
    }

    let data = writer
        .into_inner()
        .map_err(|e| EtlError::Storage(format!("Failed to finish rejected CSV: {}", e)))?;
    Ok(Bytes::from(data))
}

/// Write (or clear) the rejected side output at `location`.
///
/// Returns the location when rows were written.
pub async fn write_rejected(
    store: &dyn ObjectStore,
    location: &ObjectLocation,
    raw_columns: &[String],
    rejected: &[RejectedRow],
) -> Result<Option<ObjectLocation>> {
    if rejected.is_empty() {
        store.delete(location).await?;
        return Ok(None);
    }

    let data = encode_rejected(raw_columns, rejected)?;
    store.put(location, data).await?;
    warn!("Routed {} rejected rows to {}", rejected.len(), location);
    Ok(Some(location.clone()))
}
