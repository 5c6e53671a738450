use crate::error::{EtlError, Result};
use crate::guard::{DuplicateRunGuard, GuardDecision, SkipReason};
use crate::jobs::{transform_arguments, JobRunner};
use crate::lease::RunLease;
use crate::notify::Notifier;
use crate::types::{ArrivalEvent, HandlerResponse, InvocationContext};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Runs fetched when checking whether a just-started run already finished
const RECENT_RUNS_CHECKED: usize = 10;

/// Result of dispatching one arrival record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started { bucket: String, key: String, run_id: String },
    Skipped { bucket: String, key: String, reason: SkipReason },
}

/// Starts one batch-transform run per arrived object, unless the guard says skip
pub struct Dispatcher {
    job_name: String,
    pipeline_label: String,
    guard: DuplicateRunGuard,
    runner: Arc<dyn JobRunner>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(
        job_name: &str,
        pipeline_label: &str,
        guard: DuplicateRunGuard,
        runner: Arc<dyn JobRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            job_name: job_name.to_string(),
            pipeline_label: pipeline_label.to_string(),
            guard,
            runner,
            notifier,
        }
    }

    /// Entry point. Any failure is published as a "failed" notification and
    /// then returned to the caller.
    pub async fn handle(
        &self,
        event: &ArrivalEvent,
        ctx: &InvocationContext,
    ) -> Result<HandlerResponse> {
        if let Ok(pretty) = serde_json::to_string_pretty(event) {
            debug!(
                "{} received arrival event ({}):\n{}",
                ctx.function_name, ctx.request_id, pretty
            );
        }

        match self.dispatch(event, ctx).await {
            Ok(outcomes) => Ok(self.response(&outcomes)),
            Err(e) => {
                let message = format!("Failed to start job '{}': {}", self.job_name, e);
                error!("{}", message);
                let subject = format!("{} Job Failed", self.pipeline_label);
                if let Err(notify_err) = self.notifier.notify(&subject, &message).await {
                    error!("Failure notification could not be sent: {}", notify_err);
                }
                Err(e)
            }
        }
    }

    /// Dispatch every record in order
    pub async fn dispatch(
        &self,
        event: &ArrivalEvent,
        ctx: &InvocationContext,
    ) -> Result<Vec<DispatchOutcome>> {
        if event.records.is_empty() {
            return Err(EtlError::Dispatch("arrival event contains no records".to_string()));
        }

        let mut outcomes = Vec::with_capacity(event.records.len());
        for (idx, record) in event.records.iter().enumerate() {
            let bucket = record.bucket().to_string();
            let key = record.object_key();
            if bucket.is_empty() || key.is_empty() {
                return Err(EtlError::Dispatch(format!(
                    "record {} is missing its bucket or object key",
                    idx
                )));
            }

            match record.s3.object.size {
                Some(size) => {
                    info!("New file uploaded: s3://{}/{} ({} bytes)", bucket, key, size)
                }
                None => info!("New file uploaded: s3://{}/{}", bucket, key),
            }

            // unique per record so multi-record events claim independently
            let holder = format!("{}#{}", ctx.request_id, idx);
            outcomes.push(self.dispatch_one(bucket, key, &holder).await?);
        }
        Ok(outcomes)
    }

    async fn dispatch_one(
        &self,
        bucket: String,
        key: String,
        holder: &str,
    ) -> Result<DispatchOutcome> {
        if let GuardDecision::Skip(reason) = self.guard.claim(&self.job_name, holder).await? {
            let message = format!(
                "Job '{}' is already running ({}). Skipping trigger for: {}",
                self.job_name, reason, key
            );
            warn!("{}", message);
            self.notifier
                .notify(
                    &format!("{} Job Skipped (Already Running)", self.pipeline_label),
                    &message,
                )
                .await?;
            return Ok(DispatchOutcome::Skipped { bucket, key, reason });
        }

        let arguments = transform_arguments(&bucket, &key);
        let run_id = match self.runner.start_run(&self.job_name, &arguments).await {
            Ok(run_id) => run_id,
            Err(e) => {
                if let Some(lease) = self.guard.lease() {
                    if let Err(release_err) = lease.release(&self.job_name, Some(holder)).await {
                        warn!("Could not release claim after failed start: {}", release_err);
                    }
                }
                return Err(e);
            }
        };

        if let Some(lease) = self.guard.lease() {
            match lease.transfer(&self.job_name, holder, &run_id).await {
                Ok(true) => {
                    debug!("Claim for '{}' now held by run {}", self.job_name, run_id);
                    self.release_if_finished(lease.as_ref(), &run_id).await;
                }
                Ok(false) => warn!(
                    "Claim for '{}' was not transferred to run {}",
                    self.job_name, run_id
                ),
                Err(e) => warn!("Claim transfer to run {} failed: {}", run_id, e),
            }
        }

        let message = format!(
            "Job started successfully!\nJob ID: {}\nFile: s3://{}/{}",
            run_id, bucket, key
        );
        info!("{}", message);
        self.notifier
            .notify(&format!("{} Job Started", self.pipeline_label), &message)
            .await?;

        Ok(DispatchOutcome::Started { bucket, key, run_id })
    }

    /// A run can finish, and its terminal lifecycle event can be relayed,
    /// before the claim is transferred to it. The relay then finds the claim
    /// under the dispatcher's holder and leaves it, so re-check the run here.
    async fn release_if_finished(&self, lease: &dyn RunLease, run_id: &str) {
        let runs = match self.runner.recent_runs(&self.job_name, RECENT_RUNS_CHECKED).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!("Could not re-check run {} after claim transfer: {}", run_id, e);
                return;
            }
        };

        let Some(run) = runs.iter().find(|r| r.run_id == run_id) else {
            return;
        };
        if run.state.is_terminal() {
            info!(
                "Run {} (started {:?}) already finished as {}; releasing claim",
                run_id, run.started_on, run.state
            );
            if let Err(e) = lease.release(&self.job_name, Some(run_id)).await {
                warn!("Could not release claim for finished run {}: {}", run_id, e);
            }
        }
    }

    fn response(&self, outcomes: &[DispatchOutcome]) -> HandlerResponse {
        let started = outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Started { .. }))
            .count();
        let skipped = outcomes.len() - started;

        match (started, skipped) {
            (0, _) => HandlerResponse::ok("Job skipped"),
            (1, 0) => HandlerResponse::ok("Job started successfully"),
            _ => HandlerResponse::ok(&format!(
                "Started {} job run(s), skipped {}",
                started, skipped
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRun, RunState};
    use crate::lease::ObjectStoreLease;
    use crate::storage::{LocalObjectStore, ObjectStore};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRunner {
        latest: Option<RunState>,
        /// State reported for runs this fake started
        started_state: Option<RunState>,
        fail_start: bool,
        starts: Mutex<Vec<BTreeMap<String, String>>>,
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        async fn recent_runs(&self, _job_name: &str, _max: usize) -> Result<Vec<JobRun>> {
            let started = self.starts.lock().unwrap().len();
            let mut runs: Vec<JobRun> = match &self.started_state {
                Some(state) => (1..=started)
                    .rev()
                    .map(|n| JobRun {
                        run_id: format!("jr_{}", n),
                        state: state.clone(),
                        started_on: None,
                    })
                    .collect(),
                None => Vec::new(),
            };
            runs.extend(self.latest.iter().map(|state| JobRun {
                run_id: "jr_previous".to_string(),
                state: state.clone(),
                started_on: None,
            }));
            Ok(runs)
        }

        async fn start_run(
            &self,
            _job_name: &str,
            arguments: &BTreeMap<String, String>,
        ) -> Result<String> {
            if self.fail_start {
                return Err(EtlError::Dispatch("ConcurrentRunsExceededException".to_string()));
            }
            let mut starts = self.starts.lock().unwrap();
            starts.push(arguments.clone());
            Ok(format!("jr_{}", starts.len()))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, subject: &str, message: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn event(keys: &[&str]) -> ArrivalEvent {
        let records: Vec<serde_json::Value> = keys
            .iter()
            .map(|k| {
                serde_json::json!({"s3": {"bucket": {"name": "raw-trades"}, "object": {"key": k}}})
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "Records": records })).unwrap()
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            request_id: "req-1".to_string(),
            function_name: "dispatcher".to_string(),
        }
    }

    fn local_lease() -> (tempfile::TempDir, Arc<dyn RunLease>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()).unwrap());
        (dir, Arc::new(ObjectStoreLease::new(store, "locks", 600)))
    }

    fn dispatcher(
        runner: Arc<FakeRunner>,
        notifier: Arc<RecordingNotifier>,
        lease: Option<Arc<dyn RunLease>>,
    ) -> Dispatcher {
        let guard = DuplicateRunGuard::new(runner.clone()).with_lease(lease);
        Dispatcher::new("crypto_transform_job", "Crypto ETL", guard, runner, notifier)
    }

    #[tokio::test]
    async fn test_running_job_is_skipped() {
        let runner = Arc::new(FakeRunner {
            latest: Some(RunState::Running),
            ..FakeRunner::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher(runner.clone(), notifier.clone(), None);

        let response = dispatcher.handle(&event(&["uploads/trades.csv"]), &ctx()).await.unwrap();

        assert_eq!(response, HandlerResponse::ok("Job skipped"));
        assert!(runner.starts.lock().unwrap().is_empty());
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Crypto ETL Job Skipped (Already Running)");
        assert!(sent[0].1.contains("uploads/trades.csv"));
    }

    #[tokio::test]
    async fn test_idle_job_is_started_once() {
        let runner = Arc::new(FakeRunner {
            latest: Some(RunState::Succeeded),
            ..FakeRunner::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher(runner.clone(), notifier.clone(), None);

        let response = dispatcher
            .handle(&event(&["uploads/btc+trades.csv"]), &ctx())
            .await
            .unwrap();
        assert_eq!(response, HandlerResponse::ok("Job started successfully"));

        let starts = runner.starts.lock().unwrap();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0]["--SOURCE_BUCKET"], "raw-trades");
        assert_eq!(starts[0]["--SOURCE_FILE"], "uploads/btc trades.csv");

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Crypto ETL Job Started");
        assert!(sent[0].1.contains("jr_1"));
    }

    #[tokio::test]
    async fn test_no_prior_runs_proceeds() {
        let runner = Arc::new(FakeRunner::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let outcomes = dispatcher(runner.clone(), notifier, None)
            .dispatch(&event(&["a.csv"]), &ctx())
            .await
            .unwrap();
        assert!(matches!(outcomes[0], DispatchOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn test_start_failure_notifies_and_propagates() {
        let runner = Arc::new(FakeRunner {
            fail_start: true,
            ..FakeRunner::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let result = dispatcher(runner, notifier.clone(), None)
            .handle(&event(&["uploads/trades.csv"]), &ctx())
            .await;

        assert!(matches!(result, Err(EtlError::Dispatch(_))));
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Crypto ETL Job Failed");
        assert!(sent[0].1.contains("ConcurrentRunsExceededException"));
    }

    #[tokio::test]
    async fn test_empty_event_fails() {
        let notifier = Arc::new(RecordingNotifier::default());
        let result = dispatcher(Arc::new(FakeRunner::default()), notifier.clone(), None)
            .handle(&event(&[]), &ctx())
            .await;
        assert!(result.is_err());
        assert_eq!(notifier.sent.lock().unwrap()[0].0, "Crypto ETL Job Failed");
    }

    #[tokio::test]
    async fn test_lease_admits_one_of_two_records() {
        let (_dir, lease) = local_lease();
        let runner = Arc::new(FakeRunner::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let response = dispatcher(runner.clone(), notifier.clone(), Some(Arc::clone(&lease)))
            .handle(&event(&["a.csv", "b.csv"]), &ctx())
            .await
            .unwrap();

        assert_eq!(runner.starts.lock().unwrap().len(), 1);
        assert_eq!(response, HandlerResponse::ok("Started 1 job run(s), skipped 1"));

        // the claim now belongs to the started run
        lease.release("crypto_transform_job", Some("jr_1")).await.unwrap();
        assert!(lease.try_claim("crypto_transform_job", "next").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_start_releases_claim() {
        let (_dir, lease) = local_lease();
        let runner = Arc::new(FakeRunner {
            fail_start: true,
            ..FakeRunner::default()
        });

        let notifier = Arc::new(RecordingNotifier::default());
        let result = dispatcher(runner, notifier, Some(Arc::clone(&lease)))
            .handle(&event(&["a.csv"]), &ctx())
            .await;
        assert!(result.is_err());
        assert!(lease.try_claim("crypto_transform_job", "retry").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_finished_before_transfer_frees_claim() {
        let (_dir, lease) = local_lease();
        let runner = Arc::new(FakeRunner {
            started_state: Some(RunState::Succeeded),
            ..FakeRunner::default()
        });

        dispatcher(runner, Arc::new(RecordingNotifier::default()), Some(Arc::clone(&lease)))
            .handle(&event(&["a.csv"]), &ctx())
            .await
            .unwrap();

        // the relay already saw SUCCEEDED, so nobody else will release it
        assert!(lease.try_claim("crypto_transform_job", "next").await.unwrap());
    }

    #[tokio::test]
    async fn test_running_run_keeps_claim() {
        let (_dir, lease) = local_lease();
        let runner = Arc::new(FakeRunner {
            started_state: Some(RunState::Running),
            ..FakeRunner::default()
        });

        dispatcher(runner, Arc::new(RecordingNotifier::default()), Some(Arc::clone(&lease)))
            .handle(&event(&["a.csv"]), &ctx())
            .await
            .unwrap();

        assert!(!lease.try_claim("crypto_transform_job", "next").await.unwrap());
    }
}
