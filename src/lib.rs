pub mod config;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod jobs;
pub mod lease;
pub mod normalizer;
pub mod notify;
pub mod status_relay;
pub mod storage;
pub mod transform;
pub mod types;

use std::sync::Arc;

// Re-export commonly used types
pub use config::{JobArguments, LeaseConfig, NotifyChannel, PipelineConfig, StorageBackend};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{EtlError, Result};
pub use guard::{DuplicateRunGuard, GuardDecision, SkipReason};
pub use jobs::{GlueJobRunner, JobRun, JobRunner, RunState};
pub use lease::{ObjectStoreLease, RunLease};
pub use normalizer::{BatchMetadata, InputSchema, NormalizedRecord, RejectReason, RejectedRow};
pub use notify::{notifier_for, Notifier, SnsNotifier, WebhookNotifier};
pub use status_relay::StatusRelay;
pub use storage::{open_store, LocalObjectStore, ObjectLocation, ObjectStore, S3ObjectStore};
pub use transform::{BatchTransform, TransformReport};
pub use types::{ArrivalEvent, HandlerResponse, InvocationContext, LifecycleEvent};

/// Initialize logging for the pipeline binaries. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();
}

/// Build the run lease a deployment configures, if any
pub fn lease_for(
    config: &PipelineConfig,
    store: Arc<dyn ObjectStore>,
) -> Option<Arc<dyn RunLease>> {
    config.lease.as_ref().map(|lease| {
        Arc::new(ObjectStoreLease::new(store, &lease.bucket, lease.ttl_secs)) as Arc<dyn RunLease>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Just verify that main exports are accessible
        let args = JobArguments::parse(["--SOURCE_BUCKET", "b", "--SOURCE_FILE", "k.csv"]).unwrap();
        assert_eq!(args.source_file, "k.csv");
        assert_eq!(RunState::parse("RUNNING"), RunState::Running);
    }

    #[test]
    fn test_lease_only_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()).unwrap());

        let mut config = PipelineConfig::from_lookup(|_| None).unwrap();
        assert!(lease_for(&config, Arc::clone(&store)).is_none());

        config.lease = Some(LeaseConfig {
            bucket: "locks".to_string(),
            ttl_secs: 60,
        });
        assert!(lease_for(&config, store).is_some());
    }
}
