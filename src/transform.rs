//! Batch transform: read one trade CSV, normalize, deduplicate, sort, and
//! overwrite its date partition.
//!
//! Output layout, for input key `uploads/btc_trades.csv` processed on
//! 2024-11-20:
//!
//! ```text
//! {bucket}/processed/date=2024-11-20/btc_trades/part-00000.snappy.parquet
//! {bucket}/processed/date=2024-11-20/btc_trades/_SUCCESS
//! {bucket}/rejected/date=2024-11-20/btc_trades/rejected.csv   (only if rows were rejected)
//! ```

use crate::config::JobArguments;
use crate::error::Result;
use crate::normalizer::{
    normalize_row, BatchMetadata, InputSchema, NormalizedRecord, RawRow, RejectReason, RejectedRow,
};
use crate::storage::parquet_writer::encode_parts;
use crate::storage::rejected_writer::{write_rejected, REJECTED_FILE};
use crate::storage::{ObjectLocation, ObjectStore, PartitionWriter};
use csv::ReaderBuilder;
use rayon::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const PROCESSED_ROOT: &str = "processed";
const REJECTED_ROOT: &str = "rejected";

/// Last path segment of the object key with every `.csv` removed
pub fn file_basename(source_file: &str) -> String {
    source_file
        .rsplit('/')
        .next()
        .unwrap_or(source_file)
        .replace(".csv", "")
}

/// `processed/date={processed_date}/{file_basename}/`
pub fn output_prefix(meta: &BatchMetadata) -> String {
    format!(
        "{}/date={}/{}/",
        PROCESSED_ROOT,
        meta.processed_date_str(),
        file_basename(&meta.source_file)
    )
}

/// `rejected/date={processed_date}/{file_basename}/rejected.csv`
pub fn rejected_key(meta: &BatchMetadata) -> String {
    format!(
        "{}/date={}/{}/{}",
        REJECTED_ROOT,
        meta.processed_date_str(),
        file_basename(&meta.source_file),
        REJECTED_FILE
    )
}

/// Parse a CSV object with a header row. Every field stays a string.
pub fn read_table(data: &[u8]) -> Result<(InputSchema, Vec<RawRow>)> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(data);
    let schema = InputSchema::from_headers(rdr.headers()?.iter())?;

    let mut rows = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result?;
        rows.push(RawRow::from_fields(idx + 1, record.iter()));
    }

    debug!("Read {} rows with columns {:?}", rows.len(), schema.raw_columns());
    Ok((schema, rows))
}

/// Normalize every row in parallel, keeping input order
pub fn normalize_table(
    schema: &InputSchema,
    rows: Vec<RawRow>,
    meta: &BatchMetadata,
) -> (Vec<NormalizedRecord>, Vec<RejectedRow>) {
    let results: Vec<std::result::Result<NormalizedRecord, RejectedRow>> = rows
        .into_par_iter()
        .map(|row| normalize_row(schema, &row, meta).map_err(|reason| RejectedRow { row, reason }))
        .collect();

    let mut records = Vec::with_capacity(results.len());
    let mut rejected = Vec::new();
    for result in results {
        match result {
            Ok(record) => records.push(record),
            Err(entry) => {
                debug!("{}", entry.reason.into_error(entry.row.row_number));
                rejected.push(entry);
            }
        }
    }
    (records, rejected)
}

/// Keep one record per `trade_id`: the one latest in input order.
///
/// Returns the survivors (unordered) and the number of records dropped.
pub fn deduplicate(records: Vec<NormalizedRecord>) -> (Vec<NormalizedRecord>, usize) {
    let total = records.len();
    let mut latest: HashMap<String, NormalizedRecord> = HashMap::with_capacity(total);

    for record in records {
        match latest.entry(record.trade_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record.row_number >= slot.get().row_number {
                    slot.insert(record);
                }
            }
        }
    }

    let survivors: Vec<NormalizedRecord> = latest.into_values().collect();
    let removed = total - survivors.len();
    (survivors, removed)
}

/// Ascending by timestamp; `trade_id` breaks ties so the order is total
pub fn sort_by_timestamp(records: &mut [NormalizedRecord]) {
    records.par_sort_unstable_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.trade_id.cmp(&b.trade_id))
    });
}

/// Outcome of one invocation
#[derive(Debug, Clone)]
pub struct TransformReport {
    pub input: ObjectLocation,
    pub output: ObjectLocation,
    pub rows_read: usize,
    pub rows_normalized: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    pub duplicates_removed: usize,
    pub rows_written: usize,
    pub parts: Vec<String>,
    pub rejected_output: Option<ObjectLocation>,
}

impl TransformReport {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// In-memory result of normalize → dedup → sort
#[derive(Debug, Clone)]
pub struct TransformedTable {
    pub schema: InputSchema,
    pub records: Vec<NormalizedRecord>,
    pub rejected: Vec<RejectedRow>,
    pub rows_read: usize,
    pub rows_normalized: usize,
    pub duplicates_removed: usize,
}

/// Pure part of the transform: CSV bytes in, sorted unique records out
pub fn transform_bytes(data: &[u8], meta: &BatchMetadata) -> Result<TransformedTable> {
    let (schema, rows) = read_table(data)?;
    let rows_read = rows.len();

    let (records, rejected) = normalize_table(&schema, rows, meta);
    let rows_normalized = records.len();

    let (mut records, duplicates_removed) = deduplicate(records);
    sort_by_timestamp(&mut records);

    Ok(TransformedTable {
        schema,
        records,
        rejected,
        rows_read,
        rows_normalized,
        duplicates_removed,
    })
}

/// Runs one read → normalize → dedup → sort → write invocation
pub struct BatchTransform {
    store: Arc<dyn ObjectStore>,
    output_bucket: Option<String>,
}

impl BatchTransform {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            output_bucket: None,
        }
    }

    /// Write partitions to `bucket` instead of the source bucket
    pub fn with_output_bucket(mut self, bucket: Option<String>) -> Self {
        self.output_bucket = bucket;
        self
    }

    pub async fn run(&self, args: &JobArguments, meta: &BatchMetadata) -> Result<TransformReport> {
        let started = Instant::now();
        let input = ObjectLocation::new(args.source_bucket.clone(), args.source_file.clone());
        info!("Processing file: {}", input);

        let data = self.store.get(&input).await?;
        let table = transform_bytes(&data, meta)?;

        let mut rejected_counts: BTreeMap<RejectReason, usize> = BTreeMap::new();
        for entry in &table.rejected {
            *rejected_counts.entry(entry.reason).or_insert(0) += 1;
        }
        if !table.rejected.is_empty() {
            warn!(
                "Rejected {} of {} rows from {}: {:?}",
                table.rejected.len(),
                table.rows_read,
                input,
                rejected_counts
            );
        }

        // Encode everything before touching the destination
        let parts = encode_parts(&table.schema, meta, &table.records)?;

        let bucket = self
            .output_bucket
            .clone()
            .unwrap_or_else(|| args.source_bucket.clone());
        let output = ObjectLocation::new(bucket.clone(), output_prefix(meta));
        info!("Writing processed data to: {}", output);

        // Side output first: a failure here leaves the old partition committed
        let rejected_location = ObjectLocation::new(bucket, rejected_key(meta));
        let rejected_output = write_rejected(
            self.store.as_ref(),
            &rejected_location,
            table.schema.raw_columns(),
            &table.rejected,
        )
        .await?;

        let commit = PartitionWriter::new(Arc::clone(&self.store))
            .commit(&output, parts)
            .await?;

        info!(
            "Transformation complete for {}: read={}, normalized={}, rejected={}, \
             duplicates={}, written={} in {:.2}s",
            input,
            table.rows_read,
            table.rows_normalized,
            table.rejected.len(),
            table.duplicates_removed,
            commit.rows,
            started.elapsed().as_secs_f64()
        );

        Ok(TransformReport {
            input,
            output,
            rows_read: table.rows_read,
            rows_normalized: table.rows_normalized,
            rejected: rejected_counts,
            duplicates_removed: table.duplicates_removed,
            rows_written: commit.rows,
            parts: commit.parts,
            rejected_output,
        })
    }
}
