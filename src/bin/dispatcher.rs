/// Arrival-event dispatcher
///
/// Reads an object-created event (JSON) from stdin, starts the batch
/// transform job for each uploaded file unless a run is already in progress,
/// and prints the handler response as JSON.
///
/// Usage:
///   dispatcher < event.json

use anyhow::Context;
use std::io::Read;
use std::sync::Arc;
use trade_etl_pipeline::config::load_aws_config;
use trade_etl_pipeline::{
    init_logging, lease_for, notifier_for, open_store, ArrivalEvent, Dispatcher, DuplicateRunGuard,
    GlueJobRunner, InvocationContext, PipelineConfig,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = PipelineConfig::from_env().context("Failed to load configuration")?;

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("Failed to read event from stdin")?;
    let event: ArrivalEvent = serde_json::from_str(&raw).context("Invalid arrival event")?;
    let ctx = InvocationContext::from_env();
    info!("Dispatcher invoked ({}) with {} record(s)", ctx.request_id, event.records.len());

    let notifier = notifier_for(config.notify_channel()?).await?;
    let sdk_config = load_aws_config().await;
    let runner = Arc::new(GlueJobRunner::new(&sdk_config));

    let lease = match &config.lease {
        Some(_) => lease_for(&config, open_store(&config.storage).await?),
        None => None,
    };
    let guard = DuplicateRunGuard::new(runner.clone()).with_lease(lease);

    let dispatcher =
        Dispatcher::new(&config.job_name, &config.pipeline_label, guard, runner, notifier);
    let response = dispatcher.handle(&event, &ctx).await?;

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}
