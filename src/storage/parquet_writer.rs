use super::{ObjectLocation, ObjectStore};
use crate::error::{EtlError, Result};
use crate::normalizer::{
    BatchMetadata, InputSchema, NormalizedRecord, PROCESSED_DATE_COLUMN, SOURCE_FILE_COLUMN,
    TIMESTAMP_COLUMN, TRADE_ID_COLUMN,
};
use arrow::array::{ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_ROWS_PER_PART: usize = 500_000; // Split into files of 500K rows
const MAX_ROW_GROUP_SIZE: usize = 64 * 1024;

/// Schema version for forward compatibility
/// Increment this when making breaking schema changes
const TRADES_SCHEMA_VERSION: &str = "1.0";

/// Commit marker, written last
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Arrow schema of the normalized table: carried columns (all UTF-8, `trade_id`
/// non-null), then `source_file`, `processed_date` and the UTC `timestamp`.
pub fn build_schema(input: &InputSchema) -> SchemaRef {
    let mut fields: Vec<Field> = input
        .passthrough_columns()
        .map(|name| Field::new(name, DataType::Utf8, name != TRADE_ID_COLUMN))
        .collect();
    fields.push(Field::new(SOURCE_FILE_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(PROCESSED_DATE_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(
        TIMESTAMP_COLUMN,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    ));
    Arc::new(Schema::new(fields))
}

fn build_record_batch(
    schema: &SchemaRef,
    input: &InputSchema,
    records: &[NormalizedRecord],
) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for idx in 0..input.passthrough_len() {
        let values: Vec<Option<&str>> = records
            .iter()
            .map(|r| r.columns.get(idx).and_then(|v| v.as_deref()))
            .collect();
        columns.push(Arc::new(StringArray::from(values)));
    }

    let sources: Vec<&str> = records.iter().map(|r| &*r.source_file).collect();
    let dates: Vec<String> = records
        .iter()
        .map(|r| r.processed_date.format("%Y-%m-%d").to_string())
        .collect();
    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_micros()).collect();

    columns.push(Arc::new(StringArray::from(sources)));
    columns.push(Arc::new(StringArray::from(dates)));
    columns.push(Arc::new(
        TimestampMicrosecondArray::from(timestamps).with_timezone("UTC"),
    ));

    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

fn writer_properties(meta: &BatchMetadata) -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(MAX_ROW_GROUP_SIZE)
        .set_key_value_metadata(Some(vec![
            KeyValue::new("schema_version".to_string(), TRADES_SCHEMA_VERSION.to_string()),
            KeyValue::new("source_file".to_string(), meta.source_file.to_string()),
            KeyValue::new("processed_date".to_string(), meta.processed_date_str()),
        ]))
        .build()
}

/// One encoded Parquet file, ready to upload
#[derive(Debug, Clone)]
pub struct EncodedPart {
    pub name: String,
    pub rows: usize,
    pub data: Bytes,
}

/// Encode sorted records into Snappy-compressed Parquet parts.
///
/// An empty table still yields one part so the output carries its schema.
pub fn encode_parts(
    input: &InputSchema,
    meta: &BatchMetadata,
    records: &[NormalizedRecord],
) -> Result<Vec<EncodedPart>> {
    let schema = build_schema(input);
    let chunks: Vec<&[NormalizedRecord]> = if records.is_empty() {
        vec![records]
    } else {
        records.chunks(MAX_ROWS_PER_PART).collect()
    };

    let mut parts = Vec::with_capacity(chunks.len());
    for (part_num, chunk) in chunks.into_iter().enumerate() {
        let batch = build_record_batch(&schema, input, chunk)?;

        let mut writer =
            ArrowWriter::try_new(Vec::new(), Arc::clone(&schema), Some(writer_properties(meta)))?;
        writer.write(&batch)?;
        let data = writer.into_inner()?;

        let name = format!("part-{:05}.snappy.parquet", part_num);
        debug!("Encoded {} ({} rows, {} bytes)", name, chunk.len(), data.len());
        parts.push(EncodedPart {
            name,
            rows: chunk.len(),
            data: Bytes::from(data),
        });
    }

    Ok(parts)
}

/// Result of committing one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCommit {
    pub prefix: ObjectLocation,
    pub parts: Vec<String>,
    pub rows: usize,
    pub stale_removed: usize,
}

/// Replaces the whole contents of one output partition
pub struct PartitionWriter {
    store: Arc<dyn ObjectStore>,
}

impl PartitionWriter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Overwrite the partition under `prefix` (a key ending in `/`).
    ///
    /// Order: drop the old commit marker, upload parts, delete keys that are
    /// not part of this write, then write the marker. A failure anywhere
    /// leaves the partition without `_SUCCESS`.
    pub async fn commit(
        &self,
        prefix: &ObjectLocation,
        parts: Vec<EncodedPart>,
    ) -> Result<PartitionCommit> {
        if !prefix.key.ends_with('/') {
            return Err(EtlError::Storage(format!(
                "Partition prefix must end with '/': {}",
                prefix
            )));
        }

        let marker = prefix.child(SUCCESS_MARKER);
        self.store.delete(&marker).await?;

        let existing = self.store.list(&prefix.bucket, &prefix.key).await?;

        let mut written = HashSet::with_capacity(parts.len());
        let mut part_names = Vec::with_capacity(parts.len());
        let mut rows = 0;
        for part in parts {
            let location = prefix.child(&part.name);
            self.store.put(&location, part.data).await?;
            info!("Wrote {} ({} rows)", location, part.rows);
            rows += part.rows;
            written.insert(location.key);
            part_names.push(part.name);
        }

        let mut stale_removed = 0;
        for key in existing {
            if key == marker.key || written.contains(&key) {
                continue;
            }
            self.store
                .delete(&ObjectLocation::new(prefix.bucket.clone(), key.clone()))
                .await?;
            debug!("Removed stale object s3://{}/{}", prefix.bucket, key);
            stale_removed += 1;
        }

        self.store.put(&marker, Bytes::new()).await?;

        Ok(PartitionCommit {
            prefix: prefix.clone(),
            parts: part_names,
            rows,
            stale_removed,
        })
    }
}
