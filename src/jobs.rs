use crate::config::JobArguments;
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use aws_sdk_glue::error::DisplayErrorContext;
use aws_sdk_glue::Client;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// State of one job run as reported by the job runner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Succeeded,
    Failed,
    Timeout,
    Error,
    Waiting,
    Expired,
    Other(String),
}

impl RunState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STARTING" => RunState::Starting,
            "RUNNING" => RunState::Running,
            "STOPPING" => RunState::Stopping,
            "STOPPED" => RunState::Stopped,
            "SUCCEEDED" => RunState::Succeeded,
            "FAILED" => RunState::Failed,
            "TIMEOUT" => RunState::Timeout,
            "ERROR" => RunState::Error,
            "WAITING" => RunState::Waiting,
            "EXPIRED" => RunState::Expired,
            _ => RunState::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunState::Starting => "STARTING",
            RunState::Running => "RUNNING",
            RunState::Stopping => "STOPPING",
            RunState::Stopped => "STOPPED",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Timeout => "TIMEOUT",
            RunState::Error => "ERROR",
            RunState::Waiting => "WAITING",
            RunState::Expired => "EXPIRED",
            RunState::Other(raw) => raw.as_str(),
        }
    }

    /// The run will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Stopped
                | RunState::Succeeded
                | RunState::Failed
                | RunState::Timeout
                | RunState::Error
                | RunState::Expired
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub run_id: String,
    pub state: RunState,
    pub started_on: Option<DateTime<Utc>>,
}

/// Managed job runner: status query and start call
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Most recent runs of `job_name`, newest first
    async fn recent_runs(&self, job_name: &str, max_results: usize) -> Result<Vec<JobRun>>;

    /// Start a run and return its identifier
    async fn start_run(
        &self,
        job_name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// Invocation parameters handed to the batch transform
pub fn transform_arguments(bucket: &str, key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (format!("--{}", JobArguments::SOURCE_BUCKET), bucket.to_string()),
        (format!("--{}", JobArguments::SOURCE_FILE), key.to_string()),
    ])
}

/// AWS Glue job runner
#[derive(Clone)]
pub struct GlueJobRunner {
    client: Client,
}

impl GlueJobRunner {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl JobRunner for GlueJobRunner {
    async fn recent_runs(&self, job_name: &str, max_results: usize) -> Result<Vec<JobRun>> {
        let max_results = i32::try_from(max_results.clamp(1, 200)).unwrap_or(1);
        let output = self
            .client
            .get_job_runs()
            .job_name(job_name)
            .max_results(max_results)
            .send()
            .await
            .map_err(|e| {
                EtlError::Dispatch(format!(
                    "GetJobRuns for '{}' failed: {}",
                    job_name,
                    DisplayErrorContext(e)
                ))
            })?;

        let runs: Vec<JobRun> = output
            .job_runs()
            .iter()
            .map(|run| JobRun {
                run_id: run.id().unwrap_or_default().to_string(),
                state: run
                    .job_run_state()
                    .map(|s| RunState::parse(s.as_str()))
                    .unwrap_or_else(|| RunState::Other("UNKNOWN".to_string())),
                started_on: run
                    .started_on()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
            })
            .collect();

        debug!("Job '{}' recent runs: {:?}", job_name, runs);
        Ok(runs)
    }

    async fn start_run(
        &self,
        job_name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<String> {
        let arguments: HashMap<String, String> =
            arguments.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let output = self
            .client
            .start_job_run()
            .job_name(job_name)
            .set_arguments(Some(arguments))
            .send()
            .await
            .map_err(|e| {
                EtlError::Dispatch(format!(
                    "StartJobRun for '{}' failed: {}",
                    job_name,
                    DisplayErrorContext(e)
                ))
            })?;

        let run_id = output
            .job_run_id()
            .map(str::to_string)
            .ok_or_else(|| {
                EtlError::Dispatch(format!("StartJobRun for '{}' returned no run id", job_name))
            })?;
        info!("Started job '{}' run {}", job_name, run_id);
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_parse() {
        assert_eq!(RunState::parse("RUNNING"), RunState::Running);
        assert_eq!(RunState::parse("succeeded"), RunState::Succeeded);
        assert_eq!(RunState::parse("PAUSED"), RunState::Other("PAUSED".to_string()));
        assert_eq!(RunState::parse("PAUSED").as_str(), "PAUSED");
        assert_eq!(RunState::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_terminal_states() {
        for state in ["SUCCEEDED", "FAILED", "STOPPED", "TIMEOUT", "ERROR", "EXPIRED"] {
            assert!(RunState::parse(state).is_terminal(), "{}", state);
        }
        for state in ["STARTING", "RUNNING", "STOPPING", "WAITING", "whatever"] {
            assert!(!RunState::parse(state).is_terminal(), "{}", state);
        }
    }

    #[test]
    fn test_transform_arguments() {
        let args = transform_arguments("raw-trades", "uploads/trades.csv");
        assert_eq!(args.len(), 2);
        assert_eq!(args["--SOURCE_BUCKET"], "raw-trades");
        assert_eq!(args["--SOURCE_FILE"], "uploads/trades.csv");

        // what the dispatcher sends is what the transform parses
        let flat: Vec<String> = args.iter().flat_map(|(k, v)| [k.clone(), v.clone()]).collect();
        let parsed = JobArguments::parse(flat).unwrap();
        assert_eq!(parsed.source_bucket, "raw-trades");
        assert_eq!(parsed.source_file, "uploads/trades.csv");
    }
}
