/// Batch transform job
///
/// Reads one trade CSV from object storage, normalizes, deduplicates and
/// sorts it, and writes the result as Parquet under
/// `processed/date=YYYY-MM-DD/{file_base}/`.
///
/// Usage:
///   batch_transform --SOURCE_BUCKET <bucket> --SOURCE_FILE <key>
///
/// Set ETL_LOCAL_ROOT to run against a directory instead of S3.

use anyhow::Context;
use std::env;
use trade_etl_pipeline::{
    init_logging, open_store, BatchMetadata, BatchTransform, JobArguments, PipelineConfig,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = PipelineConfig::from_env().context("Failed to load configuration")?;
    let args = JobArguments::parse(env::args().skip(1)).context("Invalid job arguments")?;
    if let Some(job_name) = &args.job_name {
        info!("Job run for '{}'", job_name);
    }

    let store = open_store(&config.storage).await?;
    let output_bucket = config.output_bucket(&args.source_bucket).to_string();
    let transform = BatchTransform::new(store).with_output_bucket(Some(output_bucket));
    let meta = BatchMetadata::today(&args.source_file);

    match transform.run(&args, &meta).await {
        Ok(report) => {
            println!("Input:      {}", report.input);
            println!("Output:     {}", report.output);
            println!("Rows read:  {}", report.rows_read);
            println!("Rejected:   {} {:?}", report.rejected_total(), report.rejected);
            println!("Duplicates: {}", report.duplicates_removed);
            println!("Written:    {} rows in {} part(s)", report.rows_written, report.parts.len());
            if let Some(rejected) = &report.rejected_output {
                println!("Rejected rows saved to {}", rejected);
            }
            Ok(())
        }
        Err(e) if e.is_storage() => {
            error!(
                "Storage error while transforming s3://{}/{}: {}",
                args.source_bucket, args.source_file, e
            );
            Err(e).context("Batch transform failed reading or writing objects")
        }
        Err(e) => {
            error!(
                "Transformation of s3://{}/{} failed: {}",
                args.source_bucket, args.source_file, e
            );
            Err(e).context("Batch transform failed")
        }
    }
}
