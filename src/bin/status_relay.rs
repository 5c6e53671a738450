/// Lifecycle-event status relay
///
/// Reads a job state-change event (JSON) from stdin and publishes a status
/// notification. Terminal states also release the dispatcher's run claim
/// when ETL_LEASE_BUCKET is set.
///
/// Usage:
///   status_relay < event.json

use anyhow::Context;
use std::io::Read;
use trade_etl_pipeline::{
    init_logging, lease_for, notifier_for, open_store, InvocationContext, LifecycleEvent,
    PipelineConfig, StatusRelay,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = PipelineConfig::from_env().context("Failed to load configuration")?;

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("Failed to read event from stdin")?;
    let event: LifecycleEvent = serde_json::from_str(&raw).context("Invalid lifecycle event")?;
    let ctx = InvocationContext::from_env();

    let notifier = notifier_for(config.notify_channel()?).await?;
    let lease = match &config.lease {
        Some(_) => lease_for(&config, open_store(&config.storage).await?),
        None => None,
    };

    let response = StatusRelay::new(notifier)
        .with_lease(lease)
        .handle(&event, &ctx)
        .await?;

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}
