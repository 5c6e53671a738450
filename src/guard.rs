use crate::error::Result;
use crate::jobs::{JobRun, JobRunner, RunState};
use crate::lease::RunLease;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Why a new run should not start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The job runner reports the latest run as RUNNING
    AlreadyRunning { run_id: String },
    /// Another dispatcher invocation holds the run claim
    ClaimHeld,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyRunning { run_id } => write!(f, "run {} is already running", run_id),
            SkipReason::ClaimHeld => f.write_str("another trigger has already claimed the job"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    Skip(SkipReason),
}

/// Decide from the most recent runs (newest first). Zero runs proceeds.
pub fn decide(runs: &[JobRun]) -> GuardDecision {
    match runs.first() {
        Some(latest) if latest.state == RunState::Running => {
            GuardDecision::Skip(SkipReason::AlreadyRunning {
                run_id: latest.run_id.clone(),
            })
        }
        _ => GuardDecision::Proceed,
    }
}

/// Decides whether a new batch-transform run may start.
///
/// The status check alone is check-then-act: two triggers arriving together
/// can both see no running job and both start one. With a [`RunLease`]
/// configured, a passing status check is followed by an atomic claim and
/// only the claimant proceeds.
pub struct DuplicateRunGuard {
    runner: Arc<dyn JobRunner>,
    lease: Option<Arc<dyn RunLease>>,
}

impl DuplicateRunGuard {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner, lease: None }
    }

    pub fn with_lease(mut self, lease: Option<Arc<dyn RunLease>>) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Option<&Arc<dyn RunLease>> {
        self.lease.as_ref()
    }

    /// Status check only: skip when the latest run is RUNNING
    pub async fn check(&self, job_name: &str) -> Result<GuardDecision> {
        let runs = self.runner.recent_runs(job_name, 1).await?;
        let decision = decide(&runs);
        debug!("Guard check for '{}': {:?}", job_name, decision);
        Ok(decision)
    }

    /// Status check, then claim the job for `holder` when a lease is configured
    pub async fn claim(&self, job_name: &str, holder: &str) -> Result<GuardDecision> {
        if let GuardDecision::Skip(reason) = self.check(job_name).await? {
            return Ok(GuardDecision::Skip(reason));
        }

        match &self.lease {
            Some(lease) => {
                if lease.try_claim(job_name, holder).await? {
                    Ok(GuardDecision::Proceed)
                } else {
                    info!("Job '{}' already claimed; skipping for {}", job_name, holder);
                    Ok(GuardDecision::Skip(SkipReason::ClaimHeld))
                }
            }
            None => Ok(GuardDecision::Proceed),
        }
    }
}
